//! Definition lookup: offline JMdict first, Jisho as fallback, cached per run
pub mod cache;
pub mod jisho;
pub mod jmdict;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::DictionaryConfig;
use crate::error::{MiningError, Result};
use crate::text::{escape_html, normalize_word};

pub use cache::DefinitionCache;
pub use jisho::JishoBackend;
pub use jmdict::JmdictBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionSource {
    Offline,
    Online,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub word: String,
    /// One entry per sense, in dictionary order
    pub glosses: Vec<String>,
    pub source: DefinitionSource,
}

impl Definition {
    pub fn new(word: impl Into<String>, glosses: Vec<String>, source: DefinitionSource) -> Self {
        Self {
            word: word.into(),
            glosses,
            source,
        }
    }

    /// Numbered sense list for the card's definition field
    pub fn to_html(&self, max_senses: usize) -> String {
        self.glosses
            .iter()
            .take(max_senses.max(1))
            .enumerate()
            .map(|(i, gloss)| format!("{}. {}", i + 1, escape_html(gloss)))
            .collect::<Vec<_>>()
            .join("<br>")
    }
}

/// A source of definitions
#[async_trait]
pub trait DictionaryBackend: Send + Sync {
    fn name(&self) -> &str;

    fn source(&self) -> DefinitionSource;

    /// Whether the backend can serve lookups at all (e.g. its data file exists)
    async fn is_available(&self) -> bool;

    /// `Ok(None)` means the word has no entry
    async fn lookup(&self, word: &str) -> Result<Option<Definition>>;
}

/// Resolves words through a cache and an ordered fallback chain of backends
pub struct DictionaryResolver {
    offline: Option<Arc<dyn DictionaryBackend>>,
    online: Option<Arc<dyn DictionaryBackend>>,
    cache: Arc<RwLock<HashMap<String, Definition>>>,
    offline_unavailable_logged: AtomicBool,
}

impl DictionaryResolver {
    pub fn new(
        offline: Option<Arc<dyn DictionaryBackend>>,
        online: Option<Arc<dyn DictionaryBackend>>,
    ) -> Self {
        Self {
            offline,
            online,
            cache: Arc::new(RwLock::new(HashMap::new())),
            offline_unavailable_logged: AtomicBool::new(false),
        }
    }

    /// Build the configured backends
    pub fn from_config(config: &DictionaryConfig) -> Result<Self> {
        let offline: Option<Arc<dyn DictionaryBackend>> = if config.use_offline {
            Some(Arc::new(JmdictBackend::new(config.jmdict_path.clone())))
        } else {
            None
        };

        let online: Option<Arc<dyn DictionaryBackend>> = if config.use_online {
            Some(Arc::new(JishoBackend::new(config)?))
        } else {
            None
        };

        Ok(Self::new(offline, online))
    }

    /// Seed the cache, typically from a persisted `DefinitionCache`
    pub async fn preload(&self, entries: HashMap<String, Definition>) {
        let count = entries.len();
        let mut cache = self.cache.write().await;
        cache.extend(entries);
        if count > 0 {
            info!("📚 Loaded {} cached definitions", count);
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, Definition> {
        self.cache.read().await.clone()
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Cache, then offline, then online; `NotFound` when nothing has an entry
    pub async fn resolve(&self, word: &str) -> Result<Definition> {
        let word = word.trim();
        let key = normalize_word(word);
        if key.is_empty() {
            return Err(MiningError::NotFound(word.to_string()));
        }

        if let Some(hit) = self.cache.read().await.get(&key) {
            debug!("Definition cache hit: {}", key);
            return Ok(hit.clone());
        }

        let mut found = None;
        if let Some(offline) = &self.offline {
            if offline.is_available().await {
                found = self.try_backend(offline.as_ref(), word).await;
            } else if !self.offline_unavailable_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    "Offline dictionary '{}' is unavailable, falling back to online lookups",
                    offline.name()
                );
            }
        }

        if found.is_none() {
            if let Some(online) = &self.online {
                found = self.try_backend(online.as_ref(), word).await;
            }
        }

        match found {
            Some(definition) => {
                // Concurrent misses may both fetch; last write wins
                self.cache.write().await.insert(key, definition.clone());
                Ok(definition)
            }
            None => Err(MiningError::NotFound(word.to_string())),
        }
    }

    async fn try_backend(&self, backend: &dyn DictionaryBackend, word: &str) -> Option<Definition> {
        match backend.lookup(word).await {
            Ok(Some(definition)) if !definition.glosses.is_empty() => Some(definition),
            Ok(_) => {
                debug!("{}: no entry for {}", backend.name(), word);
                None
            }
            Err(e) => {
                warn!("{} lookup failed for {}: {}", backend.name(), word, e);
                None
            }
        }
    }
}
