//! Shared fakes for the integration tests: a scripted tokenizer, a media tool
//! that writes placeholder files, map-backed dictionaries and a recording card service.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use anki_miner_rust::anki::{CardService, CommitOutcome};
use anki_miner_rust::assembler::CardRecord;
use anki_miner_rust::config::{Config, ConfigBuilder};
use anki_miner_rust::dictionary::{Definition, DefinitionSource, DictionaryBackend, DictionaryResolver};
use anki_miner_rust::error::{ExtractionError, MiningError, Result};
use anki_miner_rust::media::{AudioTrack, ExtractionResult, MediaExtractor, MediaTool, VideoProbe};
use anki_miner_rust::pipeline::MiningPipeline;
use anki_miner_rust::tokenizer::{PartOfSpeech, Token, Tokenizer};

/// Splits on whitespace; each piece is `base/POS` or just `base` (a noun)
pub struct ScriptedTokenizer;

#[async_trait]
impl Tokenizer for ScriptedTokenizer {
    async fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        Ok(text
            .split_whitespace()
            .map(|piece| {
                let (word, pos) = match piece.split_once('/') {
                    Some((word, "particle")) => (word, PartOfSpeech::Particle),
                    Some((word, "aux")) => (word, PartOfSpeech::Auxiliary),
                    Some((word, "adj")) => (word, PartOfSpeech::Adjective),
                    Some((word, "verb")) => (word, PartOfSpeech::Verb),
                    Some((word, _)) => (word, PartOfSpeech::Other),
                    None => (piece, PartOfSpeech::Noun),
                };
                Token::new(word, word, pos)
            })
            .collect())
    }
}

/// Media tool that records calls and writes small placeholder files
#[derive(Default)]
pub struct CountingMediaTool {
    pub probes: AtomicUsize,
    pub captures: AtomicUsize,
    /// Screenshot times (ms) that fail with a process error
    pub fail_at_ms: Mutex<HashSet<u128>>,
    /// Artificial latency per capture, keyed by screenshot time in ms
    pub delays_ms: Mutex<HashMap<u128, u64>>,
    pub default_delay_ms: u64,
    pub duration: Duration,
    /// Screenshot captures running right now, and the most seen at once
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl CountingMediaTool {
    pub fn new() -> Self {
        Self {
            duration: Duration::from_secs(1440),
            ..Self::default()
        }
    }

    pub fn with_default_delay(mut self, ms: u64) -> Self {
        self.default_delay_ms = ms;
        self
    }

    pub fn invocations(&self) -> usize {
        self.probes.load(Ordering::SeqCst) + self.captures.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTool for CountingMediaTool {
    async fn probe(&self, _video: &Path) -> ExtractionResult<VideoProbe> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(VideoProbe {
            duration: self.duration,
            audio_tracks: vec![AudioTrack {
                index: 1,
                language: Some("jpn".to_string()),
                is_default: true,
            }],
        })
    }

    async fn capture_screenshot(&self, _video: &Path, at: Duration, output: &Path) -> ExtractionResult<()> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let result = self.screenshot(at, output).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn capture_audio(
        &self,
        _video: &Path,
        _start: Duration,
        _length: Duration,
        _track: &AudioTrack,
        output: &Path,
    ) -> ExtractionResult<()> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(output, b"mp3").await?;
        Ok(())
    }
}

impl CountingMediaTool {
    async fn screenshot(&self, at: Duration, output: &Path) -> ExtractionResult<()> {
        let delay = self
            .delays_ms
            .lock()
            .unwrap()
            .get(&at.as_millis())
            .copied()
            .unwrap_or(self.default_delay_ms);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_at_ms.lock().unwrap().contains(&at.as_millis()) {
            return Err(ExtractionError::ProcessFailed {
                program: "ffmpeg".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        tokio::fs::write(output, b"jpg").await?;
        Ok(())
    }
}

pub struct MapDictionary {
    entries: HashMap<String, Vec<String>>,
    source: DefinitionSource,
    pub lookups: AtomicUsize,
    /// Artificial latency per lookup
    pub delay_ms: AtomicU64,
}

impl MapDictionary {
    pub fn new(source: DefinitionSource, entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(w, g)| (w.to_string(), vec![g.to_string()]))
                .collect(),
            source,
            lookups: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl DictionaryBackend for MapDictionary {
    fn name(&self) -> &str {
        "map"
    }

    fn source(&self) -> DefinitionSource {
        self.source
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn lookup(&self, word: &str) -> Result<Option<Definition>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self
            .entries
            .get(word)
            .map(|g| Definition::new(word, g.clone(), self.source)))
    }
}

#[derive(Default)]
pub struct RecordingCardService {
    pub batches: Mutex<Vec<Vec<CardRecord>>>,
    pub fail: bool,
    /// Words whose notes are refused, as Anki does for a bad note
    pub rejected: HashSet<String>,
}

impl RecordingCardService {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn rejecting(words: &[&str]) -> Self {
        Self {
            rejected: words.iter().map(|w| w.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn words(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|c| c.word.clone())
            .collect()
    }
}

#[async_trait]
impl CardService for RecordingCardService {
    async fn create_cards(&self, cards: &[CardRecord]) -> Result<CommitOutcome> {
        if self.fail {
            return Err(MiningError::Service("AnkiConnect unreachable".to_string()));
        }
        let mut batches = self.batches.lock().unwrap();
        batches.push(cards.to_vec());
        let ids = cards
            .iter()
            .enumerate()
            .map(|(i, card)| (!self.rejected.contains(&card.word)).then_some(1000 + i as i64))
            .collect::<Vec<_>>();
        let error = ids
            .iter()
            .any(Option::is_none)
            .then(|| "cannot create note because it is a duplicate".to_string());
        Ok(CommitOutcome { ids, error })
    }
}

/// Temp workspace with a media dir and helpers for fixture files
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn media_dir(&self) -> PathBuf {
        self.dir.path().join("media")
    }

    pub fn config(&self) -> Config {
        ConfigBuilder::new()
            .with_media_dir(self.media_dir())
            .with_min_word_length(1)
            .without_dictionary_cache()
            .build()
    }

    /// Placeholder video; only its path and size matter to the fakes
    pub fn video(&self, relative: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, relative.as_bytes()).unwrap();
        path
    }

    /// SRT file from (start ms, end ms, text) rows
    pub fn srt(&self, relative: &str, cues: &[(u64, u64, &str)]) -> PathBuf {
        let mut content = String::new();
        for (i, (start, end, text)) in cues.iter().enumerate() {
            content.push_str(&format!("{}\n{} --> {}\n{}\n\n", i + 1, srt_time(*start), srt_time(*end), text));
        }
        let path = self.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn media_file_count(&self) -> usize {
        match std::fs::read_dir(self.media_dir()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

fn srt_time(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

pub struct Harness {
    pub tool: Arc<CountingMediaTool>,
    pub offline: Arc<MapDictionary>,
    pub online: Arc<MapDictionary>,
    pub service: Arc<RecordingCardService>,
    pub pipeline: MiningPipeline,
}

pub const DICTIONARY: &[(&str, &str)] = &[
    ("猫", "cat"),
    ("好き", "liked; fond of"),
    ("走る", "to run"),
    ("犬", "dog"),
    ("空", "sky"),
    ("海", "sea"),
];

pub fn harness(config: &Config, tool: CountingMediaTool, service: RecordingCardService) -> Harness {
    let tool = Arc::new(tool);
    let offline = Arc::new(MapDictionary::new(DefinitionSource::Offline, DICTIONARY));
    let online = Arc::new(MapDictionary::new(DefinitionSource::Online, &[("海", "ocean")]));
    let service = Arc::new(service);

    let resolver = Arc::new(DictionaryResolver::new(
        Some(offline.clone() as Arc<dyn DictionaryBackend>),
        Some(online.clone() as Arc<dyn DictionaryBackend>),
    ));
    let extractor = Arc::new(MediaExtractor::new(
        tool.clone() as Arc<dyn MediaTool>,
        config.media.media_dir.clone(),
        &config.timing,
    ));
    let pipeline = MiningPipeline::new(
        config,
        Arc::new(ScriptedTokenizer),
        resolver,
        extractor,
        service.clone() as Arc<dyn CardService>,
    );

    Harness {
        tool,
        offline,
        online,
        service,
        pipeline,
    }
}
