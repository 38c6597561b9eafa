use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::FilterConfig;
use crate::cues::MiningUnit;
use crate::error::{MiningError, Result};
use crate::text::{is_katakana, normalize_word};
use crate::tokenizer::{PartOfSpeech, Token};

/// Which token forms count as "already known"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownWordMatch {
    BaseForm,
    BaseOrSurface,
}

/// Why a unit was kept or excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Ok,
    TooShort,
    #[serde(rename = "excluded_pos")]
    ExcludedPos,
    AlreadyKnown,
    Blacklisted,
    /// Ranked beyond `max_frequency_rank`
    Infrequent,
    /// Seen in fewer episodes of the batch than required
    FewEpisodes,
    /// An earlier word from the same sentence was already kept
    SameSentence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub unit: MiningUnit,
    pub keep: bool,
    pub reason: FilterReason,
}

/// One word per line; blank lines and `#` comments are skipped
pub fn parse_word_list(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(normalize_word)
        .filter(|w| !w.is_empty())
        .collect()
}

async fn read_word_list(path: &Path) -> Result<HashSet<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MiningError::Config(format!("cannot read word list {}: {}", path.display(), e)))?;
    Ok(parse_word_list(&content))
}

/// Immutable snapshot of the words already in the user's collection
#[derive(Debug, Clone, Default)]
pub struct KnownWords {
    words: Arc<HashSet<String>>,
}

impl KnownWords {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = words
            .into_iter()
            .map(|w| normalize_word(w.as_ref()))
            .filter(|w| !w.is_empty())
            .collect();
        Self {
            words: Arc::new(words),
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(&normalize_word(word))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// User blacklist and whitelist; a whitelisted word is never blocked
#[derive(Debug, Clone, Default)]
pub struct WordLists {
    blacklist: Arc<HashSet<String>>,
    whitelist: Arc<HashSet<String>>,
}

impl WordLists {
    pub fn new<B, W, S>(blacklist: B, whitelist: W) -> Self
    where
        B: IntoIterator<Item = S>,
        W: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalize = |w: S| normalize_word(w.as_ref());
        Self {
            blacklist: Arc::new(blacklist.into_iter().map(normalize).collect()),
            whitelist: Arc::new(whitelist.into_iter().map(normalize).collect()),
        }
    }

    /// Read the configured list files; an unset path is an empty list
    pub async fn load(blacklist: Option<&Path>, whitelist: Option<&Path>) -> Result<Self> {
        let mut lists = Self::default();
        if let Some(path) = blacklist {
            lists.blacklist = Arc::new(read_word_list(path).await?);
            info!("🚫 Loaded {} blacklisted words", lists.blacklist.len());
        }
        if let Some(path) = whitelist {
            lists.whitelist = Arc::new(read_word_list(path).await?);
            info!("✅ Loaded {} whitelisted words", lists.whitelist.len());
        }
        Ok(lists)
    }

    pub fn is_blacklisted(&self, word: &str) -> bool {
        self.blacklist.contains(&normalize_word(word))
    }

    pub fn is_whitelisted(&self, word: &str) -> bool {
        self.whitelist.contains(&normalize_word(word))
    }

    pub fn blocks(&self, word: &str) -> bool {
        self.is_blacklisted(word) && !self.is_whitelisted(word)
    }
}

/// Corpus frequency ranks, 1 being the most common word
#[derive(Debug, Clone, Default)]
pub struct FrequencyRanks {
    ranks: Arc<HashMap<String, u32>>,
}

impl FrequencyRanks {
    /// Two-column CSV in either `rank,word` or `word,rank` order, detected per row.
    /// Unparseable rows are skipped and the first rank seen for a word wins.
    pub fn parse(content: &str) -> Self {
        let mut ranks = HashMap::new();
        for line in content.lines() {
            let mut columns = line.split(',').map(|c| c.trim().trim_matches('"'));
            let (Some(first), Some(second)) = (columns.next(), columns.next()) else {
                continue;
            };

            let (word, rank) = match (first.parse::<u32>(), second.parse::<u32>()) {
                (Ok(rank), _) => (second, rank),
                (Err(_), Ok(rank)) => (first, rank),
                _ => continue,
            };
            let word = normalize_word(word);
            if !word.is_empty() {
                ranks.entry(word).or_insert(rank);
            }
        }
        Self {
            ranks: Arc::new(ranks),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MiningError::Config(format!("cannot read frequency list {}: {}", path.display(), e))
        })?;
        let ranks = Self::parse(&content);
        info!("📊 Loaded {} frequency entries", ranks.len());
        Ok(ranks)
    }

    pub fn rank(&self, word: &str) -> Option<u32> {
        self.ranks.get(&normalize_word(word)).copied()
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

/// How many episodes of a batch each base form appears in
#[derive(Debug, Clone, Default)]
pub struct EpisodeCounts {
    counts: Arc<HashMap<String, usize>>,
    min_appearances: usize,
}

impl EpisodeCounts {
    pub fn new(counts: HashMap<String, usize>, min_appearances: usize) -> Self {
        Self {
            counts: Arc::new(counts),
            min_appearances,
        }
    }

    pub fn count(&self, word: &str) -> usize {
        self.counts.get(&normalize_word(word)).copied().unwrap_or(0)
    }

    pub fn meets_minimum(&self, word: &str) -> bool {
        self.min_appearances <= 1 || self.count(word) >= self.min_appearances
    }
}

/// Classifies tokens into mineable words and exclusions
#[derive(Debug, Clone)]
pub struct WordFilter {
    min_word_length: usize,
    excluded_pos: HashSet<PartOfSpeech>,
    known_word_match: KnownWordMatch,
    detect_onomatopoeia: bool,
    max_frequency_rank: u32,
    deduplicate_sentences: bool,
    known: KnownWords,
    word_lists: WordLists,
    frequency: FrequencyRanks,
    episode_counts: Option<EpisodeCounts>,
}

impl WordFilter {
    pub fn new(config: &FilterConfig, known: KnownWords) -> Self {
        Self {
            min_word_length: config.min_word_length,
            excluded_pos: config.excluded_pos.iter().copied().collect(),
            known_word_match: config.known_word_match,
            detect_onomatopoeia: config.detect_onomatopoeia,
            max_frequency_rank: config.max_frequency_rank,
            deduplicate_sentences: config.deduplicate_sentences,
            known,
            word_lists: WordLists::default(),
            frequency: FrequencyRanks::default(),
            episode_counts: None,
        }
    }

    pub fn with_word_lists(mut self, word_lists: WordLists) -> Self {
        self.word_lists = word_lists;
        self
    }

    pub fn with_frequency(mut self, frequency: FrequencyRanks) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_episode_counts(mut self, counts: EpisodeCounts) -> Self {
        self.episode_counts = Some(counts);
        self
    }

    pub fn known_words(&self) -> &KnownWords {
        &self.known
    }

    /// First matching reason wins: length, part of speech, known words, word
    /// lists, frequency rank, then episode appearances
    pub fn classify_token(&self, token: &Token) -> FilterReason {
        let base = &token.base_form;
        if base.chars().count() < self.min_word_length {
            return FilterReason::TooShort;
        }

        if self.excluded_pos.contains(&token.part_of_speech)
            || (self.detect_onomatopoeia
                && may_be_onomatopoeia(token.part_of_speech)
                && is_onomatopoeia(base))
        {
            return FilterReason::ExcludedPos;
        }

        let known = match self.known_word_match {
            KnownWordMatch::BaseForm => self.known.contains(base),
            KnownWordMatch::BaseOrSurface => self.known.contains(base) || self.known.contains(&token.surface),
        };
        if known {
            return FilterReason::AlreadyKnown;
        }

        if self.word_lists.blocks(base) {
            return FilterReason::Blacklisted;
        }

        // Words missing from the frequency list are kept
        if self.max_frequency_rank > 0 {
            if let Some(rank) = self.frequency.rank(base) {
                if rank > self.max_frequency_rank {
                    return FilterReason::Infrequent;
                }
            }
        }

        if let Some(counts) = &self.episode_counts {
            if !counts.meets_minimum(base) {
                return FilterReason::FewEpisodes;
            }
        }

        FilterReason::Ok
    }

    pub fn classify(&self, unit: MiningUnit) -> FilterDecision {
        let reason = self.classify_token(&unit.token);
        FilterDecision {
            unit,
            keep: reason == FilterReason::Ok,
            reason,
        }
    }

    /// Classify in cue order; with sentence dedup on, only the first kept word
    /// of each sentence text stays kept
    pub fn classify_all(&self, units: Vec<MiningUnit>) -> Vec<FilterDecision> {
        let mut sentences = HashSet::new();
        units
            .into_iter()
            .map(|unit| {
                let mut decision = self.classify(unit);
                if decision.keep
                    && self.deduplicate_sentences
                    && !sentences.insert(decision.unit.cue.text.clone())
                {
                    decision.keep = false;
                    decision.reason = FilterReason::SameSentence;
                }
                decision
            })
            .collect()
    }
}

/// Sound words are tagged adverb or interjection; unknown tags are checked too
fn may_be_onomatopoeia(pos: PartOfSpeech) -> bool {
    matches!(
        pos,
        PartOfSpeech::Adverb | PartOfSpeech::Interjection | PartOfSpeech::Other
    )
}

/// Short repetitive katakana such as ドキドキ or ガッ
fn is_onomatopoeia(word: &str) -> bool {
    let chars: Vec<char> = word.chars().collect();
    if chars.is_empty() || !chars.iter().all(|&c| is_katakana(c)) {
        return false;
    }

    let unique: HashSet<char> = chars.iter().copied().collect();
    if unique.len() <= 2 && chars.len() <= 4 {
        return true;
    }

    chars.last() == Some(&'ッ') && chars.len() <= 3
}
