use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::filter::KnownWordMatch;
use crate::tokenizer::PartOfSpeech;

/// Configuration for the Anki miner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Subtitle offset and media timing
    pub timing: TimingConfig,

    /// Media extraction settings
    pub media: MediaConfig,

    /// Word filtering policy
    pub filter: FilterConfig,

    /// Morphological analyzer settings
    pub tokenizer: TokenizerConfig,

    /// Dictionary backends and cache
    pub dictionary: DictionaryConfig,

    /// AnkiConnect settings
    pub anki: AnkiConfig,

    /// Folder discovery and series grouping
    pub batch: BatchConfig,

    /// Performance and resource settings
    pub performance: PerformanceConfig,

    /// Logging and report output
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Global subtitle offset in seconds (may be negative)
    pub subtitle_offset: f64,

    /// Seconds after the cue start where the screenshot is taken
    pub screenshot_offset: f64,

    /// Seconds of audio kept before and after the cue
    pub audio_padding: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory for content-addressed screenshots and clips
    pub media_dir: PathBuf,

    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    /// Timeout for a single ffmpeg/ffprobe invocation
    pub process_timeout_secs: u64,

    /// How long in-flight extractions may run after a cancel
    pub cancel_grace_secs: u64,

    /// ffmpeg `-q:v` for screenshots (2 = high quality)
    pub jpeg_quality: u32,

    /// ffmpeg `-q:a` for libmp3lame
    pub mp3_quality: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum base form length in characters
    pub min_word_length: usize,

    /// Parts of speech never mined
    pub excluded_pos: Vec<PartOfSpeech>,

    /// Which token forms are compared against the known-words set
    pub known_word_match: KnownWordMatch,

    /// Exclude short repetitive katakana adverbs and interjections
    pub detect_onomatopoeia: bool,

    /// Words never mined, one per line
    pub blacklist_path: Option<PathBuf>,

    /// Words exempt from the blacklist
    pub whitelist_path: Option<PathBuf>,

    /// `rank,word` or `word,rank` CSV
    pub frequency_list_path: Option<PathBuf>,

    /// Skip words ranked beyond this (0 = no cutoff)
    pub max_frequency_rank: u32,

    /// Mine at most one word per sentence text
    pub deduplicate_sentences: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub command: String,
    pub args: Vec<String>,

    /// Feature column holding the dictionary form (6 for IPADIC, 7 for UniDic)
    pub lemma_field: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DictionaryConfig {
    pub use_offline: bool,
    pub jmdict_path: PathBuf,
    pub use_online: bool,
    pub jisho_api_url: String,

    /// Minimum delay between online requests
    pub jisho_delay_ms: u64,

    pub request_timeout_secs: u64,

    /// Retries for transient online failures
    pub max_retries: u32,

    /// Senses rendered into the card definition
    pub max_senses: usize,

    /// Persisted definition cache (None disables persistence)
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnkiConfig {
    pub ankiconnect_url: String,
    pub deck_name: String,
    pub note_type: String,
    pub fields: FieldMapping,
    pub tags: Vec<String>,

    /// Notes per addNotes call
    pub batch_size: usize,

    pub request_timeout_secs: u64,

    /// Local known-words store synced from Anki
    pub known_words_store: Option<PathBuf>,
}

/// Note type field names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub word: String,
    pub sentence: String,
    pub definition: String,
    pub picture: String,
    pub audio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub video_extensions: Vec<String>,
    pub subtitle_extensions: Vec<String>,

    /// Per-series subtitle offsets in seconds, keyed by series name
    pub series_offsets: HashMap<String, f64>,

    /// Only mine words seen in at least this many episodes of the batch (0 or 1 = off)
    pub min_episode_appearances: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Concurrent media extractions per episode (0 = CPU count)
    pub max_parallel_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub log_level: String,

    /// Directory for JSON run reports
    pub report_dir: Option<PathBuf>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            subtitle_offset: 0.0,
            screenshot_offset: 1.0,
            audio_padding: 0.3,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("./media"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            process_timeout_secs: 30,
            cancel_grace_secs: 5,
            jpeg_quality: 2,
            mp3_quality: 2,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_word_length: 2,
            excluded_pos: vec![
                PartOfSpeech::Particle,
                PartOfSpeech::Pronoun,
                PartOfSpeech::Interjection,
                PartOfSpeech::Auxiliary,
                PartOfSpeech::Symbol,
            ],
            known_word_match: KnownWordMatch::BaseForm,
            detect_onomatopoeia: true,
            blacklist_path: None,
            whitelist_path: None,
            frequency_list_path: None,
            max_frequency_rank: 0,
            deduplicate_sentences: false,
        }
    }
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            command: "mecab".to_string(),
            args: Vec::new(),
            lemma_field: 6,
        }
    }
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        let jmdict_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".anki_miner")
            .join("JMdict_e");

        Self {
            use_offline: true,
            jmdict_path,
            use_online: true,
            jisho_api_url: "https://jisho.org/api/v1/search/words".to_string(),
            jisho_delay_ms: 500,
            request_timeout_secs: 10,
            max_retries: 3,
            max_senses: 5,
            cache_path: Some(PathBuf::from("./cache/definitions.json")),
        }
    }
}

impl Default for AnkiConfig {
    fn default() -> Self {
        Self {
            ankiconnect_url: "http://127.0.0.1:8765".to_string(),
            deck_name: "Anki Miner".to_string(),
            note_type: "Lapis".to_string(),
            fields: FieldMapping::default(),
            tags: vec!["auto-mined".to_string()],
            batch_size: 50,
            request_timeout_secs: 30,
            known_words_store: Some(PathBuf::from("./cache/known_words.json")),
        }
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            word: "Expression".to_string(),
            sentence: "Sentence".to_string(),
            definition: "MainDefinition".to_string(),
            picture: "Picture".to_string(),
            audio: "SentenceAudio".to_string(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            video_extensions: ["mp4", "mkv", "avi", "m4v", "mov"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            subtitle_extensions: ["ass", "srt", "ssa"].iter().map(|s| s.to_string()).collect(),
            series_offsets: HashMap::new(),
            min_episode_appearances: 1,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: 6,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            report_dir: None,
        }
    }
}

impl PerformanceConfig {
    /// Worker count with 0 resolved to the number of CPUs
    pub fn effective_workers(&self) -> usize {
        if self.max_parallel_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_parallel_workers
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config_paths = vec![
            PathBuf::from("anki-miner.toml"),
            PathBuf::from("config/anki-miner.toml"),
        ];
        if let Some(config_dir) = dirs::home_dir() {
            config_paths.push(config_dir.join(".config/anki-miner/config.toml"));
        }
        config_paths.push(PathBuf::from("/etc/anki-miner/config.toml"));

        for path in &config_paths {
            if !path.exists() {
                continue;
            }
            match Self::from_file(path) {
                Ok(config) => {
                    tracing::info!("📄 Loaded configuration from: {}", path.display());
                    return Ok(config.with_env_overrides());
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {:#}", path.display(), e);
                }
            }
        }

        Err(anyhow!("No configuration file found"))
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Defaults with environment variable overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `ANKI_MINER_*` environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(workers) = std::env::var("ANKI_MINER_WORKERS") {
            match workers.parse() {
                Ok(n) => self.performance.max_parallel_workers = n,
                Err(_) => tracing::warn!("Ignoring invalid ANKI_MINER_WORKERS: {}", workers),
            }
        }

        if let Ok(offset) = std::env::var("ANKI_MINER_OFFSET") {
            match offset.parse() {
                Ok(secs) => self.timing.subtitle_offset = secs,
                Err(_) => tracing::warn!("Ignoring invalid ANKI_MINER_OFFSET: {}", offset),
            }
        }

        if let Ok(url) = std::env::var("ANKI_MINER_ANKICONNECT_URL") {
            self.anki.ankiconnect_url = url;
        }

        if let Ok(deck) = std::env::var("ANKI_MINER_DECK") {
            self.anki.deck_name = deck;
        }

        if let Ok(media_dir) = std::env::var("ANKI_MINER_MEDIA_DIR") {
            self.media.media_dir = PathBuf::from(media_dir);
        }

        if let Ok(log_level) = std::env::var("ANKI_MINER_LOG_LEVEL") {
            self.output.log_level = log_level;
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timing.audio_padding < 0.0 {
            return Err(anyhow!("audio_padding must not be negative"));
        }

        if !self.timing.subtitle_offset.is_finite() || !self.timing.screenshot_offset.is_finite() {
            return Err(anyhow!("timing offsets must be finite numbers"));
        }

        if self.filter.min_word_length == 0 {
            return Err(anyhow!("min_word_length must be greater than 0"));
        }

        if self.filter.max_frequency_rank > 0 && self.filter.frequency_list_path.is_none() {
            return Err(anyhow!("filter.max_frequency_rank needs filter.frequency_list_path"));
        }

        if self.anki.batch_size == 0 {
            return Err(anyhow!("anki.batch_size must be greater than 0"));
        }

        url::Url::parse(&self.anki.ankiconnect_url)
            .with_context(|| format!("invalid ankiconnect_url: {}", self.anki.ankiconnect_url))?;

        if self.dictionary.use_online {
            url::Url::parse(&self.dictionary.jisho_api_url)
                .with_context(|| format!("invalid jisho_api_url: {}", self.dictionary.jisho_api_url))?;
        }

        let fields = &self.anki.fields;
        for (name, value) in [
            ("word", &fields.word),
            ("sentence", &fields.sentence),
            ("definition", &fields.definition),
            ("picture", &fields.picture),
            ("audio", &fields.audio),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("anki.fields.{} must not be empty", name));
            }
        }

        for (series, offset) in &self.batch.series_offsets {
            if !offset.is_finite() {
                return Err(anyhow!("series offset for '{}' is not a finite number", series));
            }
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Anki Miner Configuration:\n\
            - Workers: {}\n\
            - Subtitle Offset: {:+.2}s\n\
            - Media Directory: {}\n\
            - Deck / Note Type: {} / {}\n\
            - AnkiConnect: {}\n\
            - Offline Dictionary: {}\n\
            - Online Dictionary: {}",
            self.performance.effective_workers(),
            self.timing.subtitle_offset,
            self.media.media_dir.display(),
            self.anki.deck_name,
            self.anki.note_type,
            self.anki.ankiconnect_url,
            if self.dictionary.use_offline {
                self.dictionary.jmdict_path.display().to_string()
            } else {
                "disabled".to_string()
            },
            if self.dictionary.use_online {
                self.dictionary.jisho_api_url.as_str()
            } else {
                "disabled"
            },
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.performance.max_parallel_workers = workers;
        self
    }

    pub fn with_subtitle_offset(mut self, seconds: f64) -> Self {
        self.config.timing.subtitle_offset = seconds;
        self
    }

    pub fn with_media_dir(mut self, dir: PathBuf) -> Self {
        self.config.media.media_dir = dir;
        self
    }

    pub fn with_min_word_length(mut self, length: usize) -> Self {
        self.config.filter.min_word_length = length;
        self
    }

    pub fn with_sentence_dedup(mut self, enabled: bool) -> Self {
        self.config.filter.deduplicate_sentences = enabled;
        self
    }

    pub fn with_min_episode_appearances(mut self, count: usize) -> Self {
        self.config.batch.min_episode_appearances = count;
        self
    }

    pub fn with_series_offset(mut self, series: impl Into<String>, seconds: f64) -> Self {
        self.config.batch.series_offsets.insert(series.into(), seconds);
        self
    }

    pub fn with_ankiconnect_url(mut self, url: impl Into<String>) -> Self {
        self.config.anki.ankiconnect_url = url.into();
        self
    }

    pub fn without_dictionary_cache(mut self) -> Self {
        self.config.dictionary.cache_path = None;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
