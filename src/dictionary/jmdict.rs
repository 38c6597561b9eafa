//! Offline JMdict backend
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{Definition, DefinitionSource, DictionaryBackend};
use crate::error::{MiningError, Result};

/// Reading (kanji or kana) to senses, each sense a "; "-joined gloss list
pub type JmdictIndex = HashMap<String, Vec<String>>;

pub struct JmdictBackend {
    path: PathBuf,
    index: OnceCell<Option<Arc<JmdictIndex>>>,
}

impl JmdictBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            index: OnceCell::new(),
        }
    }

    /// Build a backend around an already parsed index
    pub fn from_index(index: JmdictIndex) -> Self {
        Self {
            path: PathBuf::new(),
            index: OnceCell::new_with(Some(Some(Arc::new(index)))),
        }
    }

    /// Parse the dictionary file once; later calls reuse the result
    async fn index(&self) -> Option<Arc<JmdictIndex>> {
        self.index
            .get_or_init(|| async {
                match self.load().await {
                    Ok(index) => {
                        info!("📖 JMdict loaded: {} readings from {}", index.len(), self.path.display());
                        Some(Arc::new(index))
                    }
                    Err(e) => {
                        warn!("Failed to load JMdict from {}: {}", self.path.display(), e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn load(&self) -> Result<JmdictIndex> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        // Parsing the full dictionary is CPU bound
        tokio::task::spawn_blocking(move || parse_jmdict(&content))
            .await
            .map_err(|e| MiningError::Backend(format!("JMdict parser task failed: {}", e)))?
    }
}

#[async_trait]
impl DictionaryBackend for JmdictBackend {
    fn name(&self) -> &str {
        "JMdict"
    }

    fn source(&self) -> DefinitionSource {
        DefinitionSource::Offline
    }

    async fn is_available(&self) -> bool {
        if self.index.get().is_none() && !self.path.exists() {
            return false;
        }
        self.index().await.is_some()
    }

    async fn lookup(&self, word: &str) -> Result<Option<Definition>> {
        let index = self
            .index()
            .await
            .ok_or_else(|| MiningError::Backend("JMdict is not loaded".to_string()))?;

        Ok(index
            .get(word)
            .map(|senses| Definition::new(word, senses.clone(), DefinitionSource::Offline)))
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| MiningError::Backend(format!("bad selector {}: {:?}", css, e)))
}

fn texts(element: &ElementRef<'_>, selector: &Selector) -> Vec<String> {
    element
        .select(selector)
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Index every `keb` and `reb` of each entry to that entry's senses; the first entry for a reading wins
pub fn parse_jmdict(xml: &str) -> Result<JmdictIndex> {
    let document = Html::parse_document(xml);
    let entry_sel = selector("entry")?;
    let reading_sel = selector("keb, reb")?;
    let sense_sel = selector("sense")?;
    let gloss_sel = selector("gloss")?;

    let mut index = JmdictIndex::new();
    for entry in document.select(&entry_sel) {
        let senses: Vec<String> = entry
            .select(&sense_sel)
            .map(|sense| texts(&sense, &gloss_sel).join("; "))
            .filter(|s| !s.is_empty())
            .collect();
        if senses.is_empty() {
            continue;
        }

        for reading in texts(&entry, &reading_sel) {
            index.entry(reading).or_insert_with(|| senses.clone());
        }
    }

    if index.is_empty() {
        return Err(MiningError::Backend("no JMdict entries found".to_string()));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<JMdict>
<entry>
<ent_seq>1467640</ent_seq>
<k_ele><keb>猫</keb></k_ele>
<r_ele><reb>ねこ</reb></r_ele>
<sense><pos>noun</pos><gloss>cat</gloss></sense>
<sense><gloss>shamisen</gloss><gloss>geisha</gloss></sense>
</entry>
<entry>
<ent_seq>1596880</ent_seq>
<k_ele><keb>走る</keb></k_ele>
<r_ele><reb>はしる</reb></r_ele>
<sense><gloss>to run</gloss></sense>
</entry>
<entry>
<ent_seq>9999999</ent_seq>
<r_ele><reb>ねこ</reb></r_ele>
<sense><gloss>should not replace the first entry</gloss></sense>
</entry>
</JMdict>"#;

    #[test]
    fn test_parse_indexes_kanji_and_kana() {
        let index = parse_jmdict(SAMPLE).unwrap();
        assert_eq!(index.get("猫").unwrap(), &vec!["cat".to_string(), "shamisen; geisha".to_string()]);
        assert_eq!(index.get("ねこ"), index.get("猫"));
        assert_eq!(index.get("はしる").unwrap(), &vec!["to run".to_string()]);
    }

    #[test]
    fn test_parse_empty_document_fails() {
        assert!(parse_jmdict("<JMdict></JMdict>").is_err());
    }

    #[tokio::test]
    async fn test_backend_loads_file_lazily() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("JMdict_e");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let backend = JmdictBackend::new(path);
        assert!(backend.is_available().await);
        let definition = backend.lookup("走る").await.unwrap().unwrap();
        assert_eq!(definition.glosses, vec!["to run"]);
        assert_eq!(definition.source, DefinitionSource::Offline);
        assert!(backend.lookup("犬").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let backend = JmdictBackend::new(PathBuf::from("/nonexistent/JMdict_e"));
        assert!(!backend.is_available().await);
    }
}
