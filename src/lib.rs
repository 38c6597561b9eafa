/// Anki Miner - Rust Implementation
///
/// Turns (video, subtitle) pairs into vocabulary flashcards: tokenizes subtitle
/// cues, keeps unknown content words, resolves definitions and cuts a screenshot
/// and audio clip for each word before sending cards to Anki.

pub mod anki;
pub mod assembler;
pub mod batch;
pub mod config;
pub mod cues;
pub mod dictionary;
pub mod error;
pub mod export;
pub mod filter;
pub mod media;
pub mod pipeline;
pub mod progress;
pub mod subtitle;
pub mod text;
pub mod tokenizer;
pub mod validation;

// Re-export main types for easy access
pub use crate::anki::{AnkiConnectClient, CardService, KnownWordStore, KnownWordsFile, KnownWordsSource, SyncedKnownWords};
pub use crate::assembler::{CardAssembler, CardRecord, EmittedWords};
pub use crate::batch::{BatchCoordinator, BatchReport, BatchState};
pub use crate::config::Config;
pub use crate::cues::{CueMatcher, MiningUnit, Offset};
pub use crate::dictionary::{Definition, DictionaryBackend, DictionaryResolver};
pub use crate::error::{ExtractionError, FailureKind, MiningError, Result};
pub use crate::filter::{FilterDecision, FilterReason, KnownWords, WordFilter};
pub use crate::media::{FfmpegTool, MediaArtifact, MediaExtractor, MediaTool};
pub use crate::pipeline::{EpisodeJob, EpisodeReport, MiningPipeline, RunContext, RunMode};
pub use crate::progress::{CancellationToken, EventSink, PipelineEvent};
pub use crate::subtitle::{Cue, SubtitleParser};
pub use crate::tokenizer::{MecabTokenizer, PartOfSpeech, Token, Tokenizer};
pub use crate::validation::{SetupValidator, ValidationReport};
