use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::cues::MiningUnit;
use crate::dictionary::Definition;
use crate::error::{MiningError, Result};
use crate::filter::FilterDecision;
use crate::media::MediaArtifact;
use crate::text::normalize_word;

/// A finished card, ready for the card service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    pub word: String,
    pub sentence: String,
    /// HTML rendering of the definition
    pub definition: String,
    pub screenshot_path: PathBuf,
    pub audio_path: PathBuf,
    pub timestamp_secs: f64,
    pub source_video: PathBuf,
}

/// What a card would look like, without any media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardPreview {
    pub unit_id: usize,
    pub word: String,
    pub surface: String,
    pub sentence: String,
    pub timestamp_secs: f64,
    /// `None` when the dictionary had no entry
    pub definition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateScope {
    SameEpisode,
    PriorEpisode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateSkip {
    pub unit_id: usize,
    pub word: String,
    pub sentence: String,
    pub timestamp_secs: f64,
    pub scope: DuplicateScope,
}

/// Words already claimed by this run, shared by every episode of a batch
#[derive(Debug, Clone, Default)]
pub struct EmittedWords {
    words: Arc<Mutex<HashSet<String>>>,
}

impl EmittedWords {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked
        self.words.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false when the word was already claimed
    pub fn try_claim(&self, word: &str) -> bool {
        self.lock().insert(normalize_word(word))
    }

    pub fn release<I, S>(&self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.lock();
        for word in words {
            set.remove(&normalize_word(word.as_ref()));
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.lock().contains(&normalize_word(word))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Kept units split into first occurrences and duplicates
#[derive(Debug, Default)]
pub struct Claims {
    pub candidates: Vec<MiningUnit>,
    pub duplicates: Vec<DuplicateSkip>,
}

impl Claims {
    pub fn claimed_words(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|u| normalize_word(&u.token.base_form))
            .collect()
    }
}

/// Joins definitions and media into cards and enforces one card per word
#[derive(Debug, Clone)]
pub struct CardAssembler {
    emitted: EmittedWords,
    max_senses: usize,
}

impl CardAssembler {
    pub fn new(emitted: EmittedWords, max_senses: usize) -> Self {
        Self { emitted, max_senses }
    }

    pub fn emitted(&self) -> &EmittedWords {
        &self.emitted
    }

    /// Claim the first occurrence of each word, in cue order.
    ///
    /// Excluded decisions are ignored. A word seen earlier in this episode or
    /// claimed by a previous episode of the run is reported as a duplicate.
    pub fn claim(&self, decisions: &[FilterDecision]) -> Claims {
        let mut seen = HashSet::new();
        let mut claims = Claims::default();

        for decision in decisions.iter().filter(|d| d.keep) {
            let unit = &decision.unit;
            let key = normalize_word(&unit.token.base_form);

            let scope = if !seen.insert(key.clone()) {
                Some(DuplicateScope::SameEpisode)
            } else if !self.emitted.try_claim(&key) {
                Some(DuplicateScope::PriorEpisode)
            } else {
                None
            };

            match scope {
                Some(scope) => {
                    debug!("Duplicate {} ({:?}) at unit {}", key, scope, unit.index);
                    claims.duplicates.push(DuplicateSkip {
                        unit_id: unit.index,
                        word: unit.token.base_form.clone(),
                        sentence: unit.cue.text.clone(),
                        timestamp_secs: unit.effective_start.as_secs_f64(),
                        scope,
                    });
                }
                None => claims.candidates.push(unit.clone()),
            }
        }

        claims
    }

    pub fn preview(&self, unit: &MiningUnit, definition: Option<&Definition>) -> CardPreview {
        CardPreview {
            unit_id: unit.index,
            word: unit.token.base_form.clone(),
            surface: unit.token.surface.clone(),
            sentence: unit.cue.text.clone(),
            timestamp_secs: unit.effective_start.as_secs_f64(),
            definition: definition.map(|d| d.to_html(self.max_senses)),
        }
    }

    /// Build a card from a unit's definition and media
    pub fn assemble(&self, video: &Path, definition: &Definition, media: &MediaArtifact) -> Result<CardRecord> {
        let unit = &media.unit;
        let word = unit.token.base_form.trim();
        let sentence = unit.cue.text.trim();
        let definition_html = definition.to_html(self.max_senses);

        if word.is_empty() {
            return Err(MiningError::parse(&unit.cue.source_file, "empty word"));
        }
        if sentence.is_empty() {
            return Err(MiningError::parse(&unit.cue.source_file, "empty sentence"));
        }
        if definition_html.is_empty() {
            return Err(MiningError::NotFound(word.to_string()));
        }

        Ok(CardRecord {
            word: word.to_string(),
            sentence: sentence.to_string(),
            definition: definition_html,
            screenshot_path: media.screenshot_path.clone(),
            audio_path: media.audio_path.clone(),
            timestamp_secs: unit.effective_start.as_secs_f64(),
            source_video: video.to_path_buf(),
        })
    }
}
