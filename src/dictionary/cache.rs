//! Disk persistence for resolved definitions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::Definition;
use crate::error::Result;

/// On-disk layout of the definition cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDefinitions {
    /// When the cache was last written
    pub saved_at: DateTime<Utc>,
    /// Number of entries
    pub entry_count: usize,
    /// Normalized word to definition
    pub entries: HashMap<String, Definition>,
}

/// Loads and saves the resolver cache so repeated runs reuse lookups
#[derive(Debug, Clone)]
pub struct DefinitionCache {
    path: PathBuf,
}

impl DefinitionCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable caches load as empty
    pub async fn load(&self) -> HashMap<String, Definition> {
        if !self.path.exists() {
            debug!("No definition cache at {}", self.path.display());
            return HashMap::new();
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str::<CachedDefinitions>(&content) {
                Ok(cache) => {
                    info!(
                        "📚 Definition cache loaded: {} entries (saved {})",
                        cache.entries.len(),
                        cache.saved_at.format("%Y-%m-%d %H:%M")
                    );
                    cache.entries
                }
                Err(e) => {
                    warn!("Failed to parse definition cache {}: {}", self.path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) => {
                warn!("Failed to read definition cache {}: {}", self.path.display(), e);
                HashMap::new()
            }
        }
    }

    /// Write the cache atomically (temp file then rename)
    pub async fn save(&self, entries: &HashMap<String, Definition>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let cache = CachedDefinitions {
            saved_at: Utc::now(),
            entry_count: entries.len(),
            entries: entries.clone(),
        };
        let json_content = serde_json::to_string_pretty(&cache)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json_content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        info!("💾 Saved {} definitions to cache: {}", cache.entry_count, self.path.display());
        Ok(())
    }
}
