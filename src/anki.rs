//! AnkiConnect card service plus the known-word sources that feed the filter
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::assembler::CardRecord;
use crate::config::AnkiConfig;
use crate::error::{MiningError, Result};
use crate::filter::parse_word_list;
use crate::text::{escape_html, normalize_word, strip_html};

pub type CardId = i64;

/// Per-card result of one commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    /// Aligned with the submitted cards; `None` where no note was created
    pub ids: Vec<Option<CardId>>,
    /// Why some cards were not created
    pub error: Option<String>,
}

impl CommitOutcome {
    /// Every card was created
    pub fn complete(ids: Vec<CardId>) -> Self {
        Self {
            ids: ids.into_iter().map(Some).collect(),
            error: None,
        }
    }

    pub fn id_for(&self, index: usize) -> Option<CardId> {
        self.ids.get(index).copied().flatten()
    }

    pub fn created(&self) -> Vec<CardId> {
        self.ids.iter().flatten().copied().collect()
    }
}

/// Receives finished cards.
///
/// `Err` means nothing was created; a partial commit comes back as an
/// outcome with `None` ids and an error message.
#[async_trait]
pub trait CardService: Send + Sync {
    async fn create_cards(&self, cards: &[CardRecord]) -> Result<CommitOutcome>;
}

/// Snapshot of the words the user already studies
#[async_trait]
pub trait KnownWordsSource: Send + Sync {
    async fn known_words(&self) -> Result<HashSet<String>>;
}

const ANKICONNECT_VERSION: u32 = 6;

#[derive(Debug, Deserialize)]
struct AnkiResponse<T> {
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NoteInfo {
    #[serde(default)]
    fields: HashMap<String, NoteField>,
}

#[derive(Debug, Deserialize)]
struct NoteField {
    value: String,
}

pub struct AnkiConnectClient {
    client: reqwest::Client,
    config: AnkiConfig,
}

impl AnkiConnectClient {
    pub fn new(config: &AnkiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MiningError::Service(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn invoke<T: DeserializeOwned>(&self, action: &str, params: Value) -> Result<T> {
        let body = json!({
            "action": action,
            "version": ANKICONNECT_VERSION,
            "params": params,
        });

        let response = self
            .client
            .post(&self.config.ankiconnect_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MiningError::Service(format!("AnkiConnect unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(MiningError::Service(format!(
                "AnkiConnect {} returned {}",
                action,
                response.status()
            )));
        }

        let parsed: AnkiResponse<T> = response
            .json()
            .await
            .map_err(|e| MiningError::Service(format!("invalid AnkiConnect response to {}: {}", action, e)))?;

        if let Some(error) = parsed.error {
            return Err(MiningError::Service(format!("{}: {}", action, error)));
        }
        parsed
            .result
            .ok_or_else(|| MiningError::Service(format!("{}: empty result", action)))
    }

    pub async fn version(&self) -> Result<u32> {
        self.invoke("version", json!({})).await
    }

    pub async fn deck_names(&self) -> Result<Vec<String>> {
        self.invoke("deckNames", json!({})).await
    }

    pub async fn model_names(&self) -> Result<Vec<String>> {
        self.invoke("modelNames", json!({})).await
    }

    /// Copy a file into the collection's media folder; returns the stored name
    pub async fn store_media(&self, path: &Path) -> Result<String> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| MiningError::Service(format!("not a file: {}", path.display())))?;
        let absolute = tokio::fs::canonicalize(path).await?;

        self.invoke(
            "storeMediaFile",
            json!({
                "filename": filename,
                "path": absolute.to_string_lossy(),
            }),
        )
        .await
    }

    fn note(&self, card: &CardRecord, picture: &str, audio: &str) -> Value {
        let fields = &self.config.fields;
        let mut values = serde_json::Map::new();
        values.insert(fields.word.clone(), Value::String(escape_html(&card.word)));
        values.insert(fields.sentence.clone(), Value::String(escape_html(&card.sentence)));
        // Already rendered as HTML
        values.insert(fields.definition.clone(), Value::String(card.definition.clone()));
        values.insert(
            fields.picture.clone(),
            Value::String(format!("<img src=\"{}\">", escape_html(picture))),
        );
        values.insert(fields.audio.clone(), Value::String(format!("[sound:{}]", audio)));

        json!({
            "deckName": self.config.deck_name,
            "modelName": self.config.note_type,
            "fields": values,
            "tags": self.config.tags,
            "options": {"allowDuplicate": false},
        })
    }

    /// One id slot per card; `None` where Anki refused the note
    async fn add_chunk(&self, cards: &[CardRecord]) -> Result<Vec<Option<CardId>>> {
        let mut notes = Vec::with_capacity(cards.len());
        for card in cards {
            let picture = self.store_media(&card.screenshot_path).await?;
            let audio = self.store_media(&card.audio_path).await?;
            notes.push(self.note(card, &picture, &audio));
        }

        let mut ids: Vec<Option<CardId>> = self.invoke("addNotes", json!({ "notes": notes })).await?;
        ids.resize(cards.len(), None);
        Ok(ids)
    }
}

#[async_trait]
impl CardService for AnkiConnectClient {
    async fn create_cards(&self, cards: &[CardRecord]) -> Result<CommitOutcome> {
        let mut outcome = CommitOutcome::default();
        let mut errors = Vec::new();
        let mut stopped = false;

        for chunk in cards.chunks(self.config.batch_size.max(1)) {
            if stopped {
                outcome.ids.extend(std::iter::repeat(None).take(chunk.len()));
                continue;
            }

            match self.add_chunk(chunk).await {
                Ok(ids) => {
                    let rejected: Vec<&str> = ids
                        .iter()
                        .zip(chunk)
                        .filter(|(id, _)| id.is_none())
                        .map(|(_, card)| card.word.as_str())
                        .collect();
                    if !rejected.is_empty() {
                        warn!("Anki rejected {} note(s): {}", rejected.len(), rejected.join(", "));
                        errors.push(format!("Anki rejected {}", rejected.join(", ")));
                    }
                    debug!("Added {} notes to {}", chunk.len() - rejected.len(), self.config.deck_name);
                    outcome.ids.extend(ids);
                }
                Err(e) => {
                    // Later chunks would hit the same failure
                    warn!("Stopping commit after error: {}", e);
                    errors.push(e.to_string());
                    outcome.ids.extend(std::iter::repeat(None).take(chunk.len()));
                    stopped = true;
                }
            }
        }

        let created = outcome.created().len();
        if !errors.is_empty() {
            let message = errors.join("; ");
            if created == 0 {
                return Err(MiningError::Service(message));
            }
            outcome.error = Some(message);
        }

        info!("📤 Created {} notes in deck '{}'", created, self.config.deck_name);
        Ok(outcome)
    }
}

#[async_trait]
impl KnownWordsSource for AnkiConnectClient {
    async fn known_words(&self) -> Result<HashSet<String>> {
        let field = &self.config.fields.word;
        let ids: Vec<CardId> = self
            .invoke("findNotes", json!({ "query": format!("\"{}:*\"", field) }))
            .await?;
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let notes: Vec<NoteInfo> = self.invoke("notesInfo", json!({ "notes": ids })).await?;
        let words: HashSet<String> = notes
            .iter()
            .filter_map(|note| note.fields.get(field))
            .map(|f| normalize_word(&strip_html(&f.value)))
            .filter(|w| !w.is_empty())
            .collect();

        info!("🗂️ Anki vocabulary: {} words from {} notes", words.len(), notes.len());
        Ok(words)
    }
}

/// Plain word list, one per line; `#` starts a comment line
#[derive(Debug, Clone)]
pub struct KnownWordsFile {
    path: PathBuf,
}

impl KnownWordsFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl KnownWordsSource for KnownWordsFile {
    async fn known_words(&self) -> Result<HashSet<String>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_word_list(&content))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredWords {
    updated_at: DateTime<Utc>,
    words: BTreeSet<String>,
}

/// Add-only local vocabulary persisted as JSON
pub struct KnownWordStore {
    path: PathBuf,
    words: Mutex<BTreeSet<String>>,
}

impl KnownWordStore {
    /// A missing file opens as an empty store
    pub async fn open(path: PathBuf) -> Result<Self> {
        let words = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let stored: StoredWords = serde_json::from_str(&content)
                    .map_err(|e| MiningError::parse(&path, format!("invalid known-word store: {}", e)))?;
                stored.words
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Known-word store {}: {} words", path.display(), words.len());
        Ok(Self {
            path,
            words: Mutex::new(words),
        })
    }

    pub async fn len(&self) -> usize {
        self.words.lock().await.len()
    }

    pub async fn words(&self) -> HashSet<String> {
        self.words.lock().await.iter().cloned().collect()
    }

    /// Merge an external vocabulary; returns (newly added, total)
    pub async fn sync(&self, words: &HashSet<String>) -> Result<(usize, usize)> {
        let mut stored = self.words.lock().await;
        let before = stored.len();
        stored.extend(words.iter().map(|w| normalize_word(w)).filter(|w| !w.is_empty()));
        let added = stored.len() - before;
        if added > 0 {
            self.persist(&stored).await?;
        }
        Ok((added, stored.len()))
    }

    /// Record words that were just turned into cards
    pub async fn add_mined<I, S>(&self, words: I) -> Result<usize>
    where
        I: IntoIterator<Item = S> + Send,
        S: AsRef<str>,
    {
        let mut stored = self.words.lock().await;
        let before = stored.len();
        for word in words {
            let word = normalize_word(word.as_ref());
            if !word.is_empty() {
                stored.insert(word);
            }
        }
        let added = stored.len() - before;
        if added > 0 {
            self.persist(&stored).await?;
        }
        Ok(added)
    }

    async fn persist(&self, words: &BTreeSet<String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let stored = StoredWords {
            updated_at: Utc::now(),
            words: words.clone(),
        };
        let content = serde_json::to_string_pretty(&stored)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KnownWordsSource for KnownWordStore {
    async fn known_words(&self) -> Result<HashSet<String>> {
        Ok(self.words().await)
    }
}

/// Anki vocabulary synced into the local store, or the store alone when Anki is down
pub struct SyncedKnownWords {
    anki: Arc<dyn KnownWordsSource>,
    store: Arc<KnownWordStore>,
}

impl SyncedKnownWords {
    pub fn new(anki: Arc<dyn KnownWordsSource>, store: Arc<KnownWordStore>) -> Self {
        Self { anki, store }
    }
}

#[async_trait]
impl KnownWordsSource for SyncedKnownWords {
    async fn known_words(&self) -> Result<HashSet<String>> {
        match self.anki.known_words().await {
            Ok(words) => {
                let (added, total) = self.store.sync(&words).await?;
                info!("🔄 Known words synced: {} new, {} total", added, total);
            }
            Err(e) => {
                warn!("Anki vocabulary unavailable, using local store only: {}", e);
            }
        }
        Ok(self.store.words().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    fn client(server: &MockServer) -> AnkiConnectClient {
        let config = AnkiConfig {
            ankiconnect_url: server.base_url(),
            batch_size: 2,
            ..AnkiConfig::default()
        };
        AnkiConnectClient::new(&config).unwrap()
    }

    async fn card(dir: &Path, word: &str) -> CardRecord {
        let screenshot_path = dir.join(format!("{}.jpg", word));
        let audio_path = dir.join(format!("{}.mp3", word));
        tokio::fs::write(&screenshot_path, b"jpg").await.unwrap();
        tokio::fs::write(&audio_path, b"mp3").await.unwrap();
        CardRecord {
            word: word.to_string(),
            sentence: format!("{}<です>", word),
            definition: "1. test".to_string(),
            screenshot_path,
            audio_path,
            timestamp_secs: 1.0,
            source_video: PathBuf::from("ep01.mkv"),
        }
    }

    #[tokio::test]
    async fn test_create_cards_stores_media_and_chunks_notes() {
        let server = MockServer::start_async().await;
        let temp_dir = TempDir::new().unwrap();

        let media = server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"storeMediaFile\"");
                then.status(200).json_body(json!({"result": "stored.bin", "error": null}));
            })
            .await;
        let add = server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("\"addNotes\"")
                    .body_contains("[sound:stored.bin]")
                    .body_contains("&lt;です&gt;");
                then.status(200).json_body(json!({"result": [101, 102], "error": null}));
            })
            .await;

        let cards = vec![
            card(temp_dir.path(), "猫").await,
            card(temp_dir.path(), "犬").await,
            card(temp_dir.path(), "鳥").await,
        ];
        let outcome = client(&server).create_cards(&cards).await.unwrap();

        // batch_size 2 gives two addNotes calls; the mock answers two ids each time
        add.assert_hits_async(2).await;
        media.assert_hits_async(6).await;
        assert_eq!(outcome.ids, vec![Some(101), Some(102), Some(101)]);
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn test_partial_rejection_keeps_created_ids() {
        let server = MockServer::start_async().await;
        let temp_dir = TempDir::new().unwrap();
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"storeMediaFile\"");
                then.status(200).json_body(json!({"result": "x", "error": null}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"addNotes\"");
                then.status(200).json_body(json!({"result": [123, null], "error": null}));
            })
            .await;

        let cards = vec![card(temp_dir.path(), "猫").await, card(temp_dir.path(), "犬").await];
        let outcome = client(&server).create_cards(&cards).await.unwrap();

        assert_eq!(outcome.ids, vec![Some(123), None]);
        assert_eq!(outcome.id_for(0), Some(123));
        assert_eq!(outcome.id_for(1), None);
        assert_eq!(outcome.created(), vec![123]);
        assert!(outcome.error.unwrap().contains("犬"));
    }

    #[tokio::test]
    async fn test_rejected_note_is_service_error() {
        let server = MockServer::start_async().await;
        let temp_dir = TempDir::new().unwrap();
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"storeMediaFile\"");
                then.status(200).json_body(json!({"result": "x", "error": null}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"addNotes\"");
                then.status(200).json_body(json!({"result": [null], "error": null}));
            })
            .await;

        let cards = vec![card(temp_dir.path(), "猫").await];
        let err = client(&server).create_cards(&cards).await.unwrap_err();
        assert!(matches!(err, MiningError::Service(_)));
    }

    #[tokio::test]
    async fn test_error_field_is_service_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"deckNames\"");
                then.status(200)
                    .json_body(json!({"result": null, "error": "collection is not available"}));
            })
            .await;

        let err = client(&server).deck_names().await.unwrap_err();
        assert!(err.to_string().contains("collection is not available"));
    }

    #[tokio::test]
    async fn test_known_words_from_notes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"findNotes\"");
                then.status(200).json_body(json!({"result": [1, 2], "error": null}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("\"notesInfo\"");
                then.status(200).json_body(json!({"result": [
                    {"fields": {"Expression": {"value": "<b>猫</b>", "order": 0}}},
                    {"fields": {"Expression": {"value": " 走る ", "order": 0}}}
                ], "error": null}));
            })
            .await;

        let words = client(&server).known_words().await.unwrap();
        assert_eq!(words, HashSet::from(["猫".to_string(), "走る".to_string()]));
    }

    #[tokio::test]
    async fn test_known_words_file_skips_comments() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("known.txt");
        tokio::fs::write(&path, "# mined before\n猫\n\n  犬  \n").await.unwrap();

        let words = KnownWordsFile::new(path).known_words().await.unwrap();
        assert_eq!(words.len(), 2);
        assert!(words.contains("犬"));
    }

    #[tokio::test]
    async fn test_store_sync_is_add_only_and_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache").join("known_words.json");

        let store = KnownWordStore::open(path.clone()).await.unwrap();
        let (added, total) = store
            .sync(&HashSet::from(["猫".to_string(), "犬".to_string()]))
            .await
            .unwrap();
        assert_eq!((added, total), (2, 2));
        assert_eq!(store.add_mined(["走る", "猫"]).await.unwrap(), 1);

        let reopened = KnownWordStore::open(path).await.unwrap();
        assert_eq!(reopened.len().await, 3);
        let (added, total) = reopened.sync(&HashSet::new()).await.unwrap();
        assert_eq!((added, total), (0, 3));
    }

    struct Unreachable;

    #[async_trait]
    impl KnownWordsSource for Unreachable {
        async fn known_words(&self) -> Result<HashSet<String>> {
            Err(MiningError::Service("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_synced_falls_back_to_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(KnownWordStore::open(temp_dir.path().join("k.json")).await.unwrap());
        store.add_mined(["猫"]).await.unwrap();

        let synced = SyncedKnownWords::new(Arc::new(Unreachable), store);
        assert_eq!(synced.known_words().await.unwrap(), HashSet::from(["猫".to_string()]));
    }
}
