use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::subtitle::Cue;
use crate::tokenizer::{Token, Tokenizer};

/// One (cue, word occurrence) candidate for a card
#[derive(Debug, Clone, PartialEq)]
pub struct MiningUnit {
    /// Position in emission order, used as the unit id in events and reports
    pub index: usize,
    pub token: Token,
    pub cue: Arc<Cue>,
    pub effective_start: Duration,
    pub effective_end: Duration,
}

/// A signed shift applied to cue timestamps, kept in whole milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset(i64);

impl Offset {
    pub fn from_secs_f64(seconds: f64) -> Self {
        if seconds.is_finite() {
            Offset((seconds * 1000.0).round() as i64)
        } else {
            Offset(0)
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Offset(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Shift a timestamp, clamping at zero
    pub fn apply(self, at: Duration) -> Duration {
        let millis = at.as_millis() as i64 + self.0;
        Duration::from_millis(millis.max(0) as u64)
    }
}

impl std::ops::Add for Offset {
    type Output = Offset;

    fn add(self, rhs: Offset) -> Offset {
        Offset(self.0.saturating_add(rhs.0))
    }
}

/// Aligns cues to timestamps and expands them into mining units
pub struct CueMatcher {
    tokenizer: Arc<dyn Tokenizer>,
    global_offset: Offset,
    episode_offset: Offset,
}

impl CueMatcher {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, global_offset: Offset, episode_offset: Offset) -> Self {
        Self {
            tokenizer,
            global_offset,
            episode_offset,
        }
    }

    pub fn total_offset(&self) -> Offset {
        self.global_offset + self.episode_offset
    }

    /// Emit one unit per token, in cue order then token order
    pub async fn match_cues(&self, cues: &[Cue]) -> Result<Vec<MiningUnit>> {
        let lines: Vec<String> = cues.iter().map(|c| c.text.clone()).collect();
        let tokenized = self.tokenizer.tokenize_lines(&lines).await?;
        let offset = self.total_offset();

        let mut units = Vec::new();
        for (cue, tokens) in cues.iter().zip(tokenized) {
            let cue = Arc::new(cue.clone());
            let effective_start = offset.apply(cue.start);
            let effective_end = offset.apply(cue.end).max(effective_start);

            for token in tokens {
                units.push(MiningUnit {
                    index: units.len(),
                    token,
                    cue: Arc::clone(&cue),
                    effective_start,
                    effective_end,
                });
            }
        }

        debug!(
            "Matched {} cues into {} units (offset {:+.3}s)",
            cues.len(),
            units.len(),
            offset.as_secs_f64()
        );
        Ok(units)
    }
}
