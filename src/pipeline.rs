use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::anki::{AnkiConnectClient, CardId, CardService, KnownWordStore, KnownWordsSource};
use crate::assembler::{CardAssembler, CardPreview, CardRecord, DuplicateSkip, EmittedWords};
use crate::config::{Config, FilterConfig};
use crate::cues::{CueMatcher, MiningUnit, Offset};
use crate::dictionary::{Definition, DefinitionCache, DictionaryResolver};
use crate::error::{ExtractionError, FailureKind, MiningError, Result};
use crate::filter::{EpisodeCounts, FilterDecision, FilterReason, FrequencyRanks, KnownWords, WordFilter, WordLists};
use crate::media::{ExtractionResult, FfmpegTool, MediaArtifact, MediaExtractor};
use crate::progress::{CancellationToken, EventSink, Outcome, PipelineEvent, Stage, TracingSink};
use crate::subtitle::SubtitleParser;
use crate::text::normalize_word;
use crate::tokenizer::{MecabTokenizer, Tokenizer};

/// One (video, subtitle) pair to mine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeJob {
    pub video_path: PathBuf,
    pub subtitle_path: PathBuf,
    /// Per-episode shift, added to the global subtitle offset
    pub offset: Offset,
}

impl EpisodeJob {
    pub fn new(video_path: impl Into<PathBuf>, subtitle_path: impl Into<PathBuf>, offset: Offset) -> Self {
        Self {
            video_path: video_path.into(),
            subtitle_path: subtitle_path.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    /// Resolve definitions only: no media, no cards, no commit
    Preview,
}

/// State shared by every episode of one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub known: KnownWords,
    pub emitted: EmittedWords,
    pub mode: RunMode,
    pub cancel: CancellationToken,
    /// Batch-wide appearance counts, when a minimum is configured
    pub episode_counts: Option<EpisodeCounts>,
}

impl RunContext {
    pub fn new(known: KnownWords, mode: RunMode) -> Self {
        Self {
            known,
            emitted: EmittedWords::new(),
            mode,
            cancel: CancellationToken::new(),
            episode_counts: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_episode_counts(mut self, counts: EpisodeCounts) -> Self {
        self.episode_counts = Some(counts);
        self
    }
}

/// Filter outcome for one unit, as listed in preview reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDecision {
    pub unit_id: usize,
    pub word: String,
    pub surface: String,
    pub sentence: String,
    pub timestamp_secs: f64,
    pub keep: bool,
    pub reason: FilterReason,
}

impl From<&FilterDecision> for UnitDecision {
    fn from(decision: &FilterDecision) -> Self {
        let unit = &decision.unit;
        Self {
            unit_id: unit.index,
            word: unit.token.base_form.clone(),
            surface: unit.token.surface.clone(),
            sentence: unit.cue.text.clone(),
            timestamp_secs: unit.effective_start.as_secs_f64(),
            keep: decision.keep,
            reason: decision.reason,
        }
    }
}

/// A unit that was kept by the filter but produced no card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_id: usize,
    pub word: String,
    pub sentence: String,
    pub timestamp_secs: f64,
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl UnitFailure {
    fn new(unit: &MiningUnit, stage: Stage, error: &MiningError) -> Self {
        Self {
            unit_id: unit.index,
            word: unit.token.base_form.clone(),
            sentence: unit.cue.text.clone(),
            timestamp_secs: unit.effective_start.as_secs_f64(),
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSummary {
    pub units: usize,
    pub kept: usize,
    pub too_short: usize,
    pub excluded_pos: usize,
    pub already_known: usize,
    pub blacklisted: usize,
    pub infrequent: usize,
    pub few_episodes: usize,
    pub same_sentence: usize,
}

impl FilterSummary {
    pub fn from_decisions(decisions: &[FilterDecision]) -> Self {
        let mut summary = Self {
            units: decisions.len(),
            ..Self::default()
        };
        for decision in decisions {
            match decision.reason {
                FilterReason::Ok => summary.kept += 1,
                FilterReason::TooShort => summary.too_short += 1,
                FilterReason::ExcludedPos => summary.excluded_pos += 1,
                FilterReason::AlreadyKnown => summary.already_known += 1,
                FilterReason::Blacklisted => summary.blacklisted += 1,
                FilterReason::Infrequent => summary.infrequent += 1,
                FilterReason::FewEpisodes => summary.few_episodes += 1,
                FilterReason::SameSentence => summary.same_sentence += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeReport {
    pub video: PathBuf,
    pub subtitle: PathBuf,
    pub mode: RunMode,
    pub offset_secs: f64,
    pub cue_count: usize,
    pub filter: FilterSummary,
    /// Every unit's filter decision; filled in preview mode
    pub decisions: Vec<UnitDecision>,
    /// In cue order
    pub cards: Vec<CardRecord>,
    pub previews: Vec<CardPreview>,
    pub failures: Vec<UnitFailure>,
    pub duplicates: Vec<DuplicateSkip>,
    pub card_ids: Vec<CardId>,
    /// Words whose cards the card service did not create
    pub uncommitted: Vec<String>,
    pub media_reused: usize,
    pub commit_error: Option<String>,
    pub cancelled: bool,
    pub elapsed_secs: f64,
}

impl EpisodeReport {
    fn new(job: &EpisodeJob, mode: RunMode, offset: Offset) -> Self {
        Self {
            video: job.video_path.clone(),
            subtitle: job.subtitle_path.clone(),
            mode,
            offset_secs: offset.as_secs_f64(),
            cue_count: 0,
            filter: FilterSummary::default(),
            decisions: Vec::new(),
            cards: Vec::new(),
            previews: Vec::new(),
            failures: Vec::new(),
            duplicates: Vec::new(),
            card_ids: Vec::new(),
            uncommitted: Vec::new(),
            media_reused: 0,
            commit_error: None,
            cancelled: false,
            elapsed_secs: 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.commit_error.is_none()
    }

    /// Cards that reached the card service and were created
    pub fn committed_cards(&self) -> usize {
        match self.mode {
            RunMode::Full => self.cards.len().saturating_sub(self.uncommitted.len()),
            RunMode::Preview => 0,
        }
    }
}

/// Result of the per-unit worker, keyed by unit index in the completion map
enum UnitResult {
    Ready {
        definition: Definition,
        media: MediaArtifact,
    },
    Failed {
        stage: Stage,
        error: MiningError,
    },
}

fn outcome_of<T>(result: &Result<T>) -> Outcome {
    match result {
        Ok(_) => Outcome::Ok,
        Err(e) => Outcome::Failed(e.kind()),
    }
}

/// Cue matching, filtering, definition lookup, media extraction and card assembly for one episode
pub struct MiningPipeline {
    tokenizer: Arc<dyn Tokenizer>,
    resolver: Arc<DictionaryResolver>,
    extractor: Arc<MediaExtractor>,
    cards: Arc<dyn CardService>,
    known_store: Option<Arc<KnownWordStore>>,
    definition_cache: Option<DefinitionCache>,
    word_lists: WordLists,
    frequency: FrequencyRanks,
    events: Arc<dyn EventSink>,
    filter_config: FilterConfig,
    global_offset: Offset,
    max_senses: usize,
    cancel_grace: Duration,
    worker_pool: Arc<Semaphore>,
    workers: usize,
}

impl MiningPipeline {
    pub fn new(
        config: &Config,
        tokenizer: Arc<dyn Tokenizer>,
        resolver: Arc<DictionaryResolver>,
        extractor: Arc<MediaExtractor>,
        cards: Arc<dyn CardService>,
    ) -> Self {
        let workers = config.performance.effective_workers();
        info!("🔧 Initializing mining pipeline with {} workers", workers);

        Self {
            tokenizer,
            resolver,
            extractor,
            cards,
            known_store: None,
            definition_cache: None,
            word_lists: WordLists::default(),
            frequency: FrequencyRanks::default(),
            events: Arc::new(TracingSink),
            filter_config: config.filter.clone(),
            global_offset: Offset::from_secs_f64(config.timing.subtitle_offset),
            max_senses: config.dictionary.max_senses,
            cancel_grace: Duration::from_secs(config.media.cancel_grace_secs),
            worker_pool: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Wire MeCab, JMdict/Jisho, ffmpeg and AnkiConnect from configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(MecabTokenizer::new(config.tokenizer.clone()));
        let resolver = Arc::new(DictionaryResolver::from_config(&config.dictionary)?);
        let extractor = Arc::new(MediaExtractor::new(
            Arc::new(FfmpegTool::new(&config.media)),
            config.media.media_dir.clone(),
            &config.timing,
        ));
        let cards: Arc<dyn CardService> = Arc::new(AnkiConnectClient::new(&config.anki)?);

        let mut pipeline = Self::new(config, tokenizer, resolver, extractor, cards);
        if let Some(path) = &config.anki.known_words_store {
            pipeline = pipeline.with_known_store(Arc::new(KnownWordStore::open(path.clone()).await?));
        }
        if let Some(path) = &config.dictionary.cache_path {
            pipeline = pipeline.with_definition_cache(DefinitionCache::new(path.clone()));
        }

        let filter = &config.filter;
        if filter.blacklist_path.is_some() || filter.whitelist_path.is_some() {
            let lists = WordLists::load(filter.blacklist_path.as_deref(), filter.whitelist_path.as_deref()).await?;
            pipeline = pipeline.with_word_lists(lists);
        }
        if let Some(path) = &filter.frequency_list_path {
            pipeline = pipeline.with_frequency_ranks(FrequencyRanks::load(path).await?);
        }
        Ok(pipeline)
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_known_store(mut self, store: Arc<KnownWordStore>) -> Self {
        self.known_store = Some(store);
        self
    }

    pub fn with_definition_cache(mut self, cache: DefinitionCache) -> Self {
        self.definition_cache = Some(cache);
        self
    }

    pub fn with_word_lists(mut self, word_lists: WordLists) -> Self {
        self.word_lists = word_lists;
        self
    }

    pub fn with_frequency_ranks(mut self, frequency: FrequencyRanks) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_global_offset(mut self, offset: Offset) -> Self {
        self.global_offset = offset;
        self
    }

    pub fn known_store(&self) -> Option<&Arc<KnownWordStore>> {
        self.known_store.as_ref()
    }

    /// Seed the resolver from the persisted definition cache
    pub async fn load_definition_cache(&self) {
        if let Some(cache) = &self.definition_cache {
            self.resolver.preload(cache.load().await).await;
        }
    }

    pub async fn save_definition_cache(&self) -> Result<()> {
        match &self.definition_cache {
            Some(cache) => cache.save(&self.resolver.snapshot().await).await,
            None => Ok(()),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        self.events.emit(event);
    }

    fn word_filter(&self, run: &RunContext) -> WordFilter {
        let filter = WordFilter::new(&self.filter_config, run.known.clone())
            .with_word_lists(self.word_lists.clone())
            .with_frequency(self.frequency.clone());
        match &run.episode_counts {
            Some(counts) => filter.with_episode_counts(counts.clone()),
            None => filter,
        }
    }

    /// Normalized base forms of every token in a subtitle file
    pub async fn scan_base_forms(&self, subtitle: &Path) -> Result<HashSet<String>> {
        let cues = SubtitleParser::parse_file(subtitle).await?;
        let matcher = CueMatcher::new(Arc::clone(&self.tokenizer), Offset::default(), Offset::default());
        let units = matcher.match_cues(&cues).await?;
        Ok(units
            .iter()
            .map(|u| normalize_word(&u.token.base_form))
            .filter(|w| !w.is_empty())
            .collect())
    }

    pub async fn run_episode(&self, job: &EpisodeJob, run: &RunContext) -> Result<EpisodeReport> {
        let started = Instant::now();
        let total_offset = self.global_offset + job.offset;
        let mut report = EpisodeReport::new(job, run.mode, total_offset);

        info!("🎬 Mining episode: {}", job.video_path.display());
        self.emit(PipelineEvent::stage(Stage::Episode, Outcome::Started));

        if run.cancel.is_cancelled() {
            report.cancelled = true;
            self.emit(PipelineEvent::stage(Stage::Episode, Outcome::Failed(FailureKind::Cancelled)));
            return Ok(report);
        }

        self.emit(PipelineEvent::stage(Stage::Parse, Outcome::Started));
        let cues = match SubtitleParser::parse_file(&job.subtitle_path).await {
            Ok(cues) => cues,
            Err(e) => {
                error!("❌ Cannot parse {}: {}", job.subtitle_path.display(), e);
                self.emit(PipelineEvent::stage(Stage::Parse, Outcome::Failed(e.kind())));
                return Err(e);
            }
        };
        self.emit(PipelineEvent::stage(Stage::Parse, Outcome::Ok));
        report.cue_count = cues.len();

        let matcher = CueMatcher::new(Arc::clone(&self.tokenizer), self.global_offset, job.offset);
        let units = match matcher.match_cues(&cues).await {
            Ok(units) => units,
            Err(e) => {
                self.emit(PipelineEvent::stage(Stage::Match, Outcome::Failed(e.kind())));
                return Err(e);
            }
        };
        self.emit(PipelineEvent::stage(Stage::Match, Outcome::Ok));

        let filter = self.word_filter(run);
        let decisions = filter.classify_all(units);
        for decision in &decisions {
            let outcome = if decision.keep {
                Outcome::Ok
            } else {
                Outcome::Filtered(decision.reason)
            };
            self.emit(PipelineEvent::unit(Stage::Filter, decision.unit.index, outcome));
        }
        report.filter = FilterSummary::from_decisions(&decisions);

        let assembler = CardAssembler::new(run.emitted.clone(), self.max_senses);
        let claims = assembler.claim(&decisions);
        for duplicate in &claims.duplicates {
            self.emit(PipelineEvent::unit(Stage::Assemble, duplicate.unit_id, Outcome::Duplicate));
        }
        report.duplicates = claims.duplicates.clone();

        info!(
            "🔍 {} cues, {} units, {} kept, {} new words",
            report.cue_count,
            report.filter.units,
            report.filter.kept,
            claims.candidates.len()
        );

        match run.mode {
            RunMode::Preview => {
                report.decisions = decisions.iter().map(UnitDecision::from).collect();
                self.preview(&claims.candidates, &assembler, &run.cancel, &mut report).await;
                report.cancelled = run.cancel.is_cancelled();
                if report.cancelled {
                    run.emitted.release(claims.claimed_words());
                } else {
                    run.emitted.release(report.failures.iter().map(|f| f.word.as_str()));
                }
            }
            RunMode::Full => {
                let completions = self.dispatch(job, &claims.candidates, &run.cancel).await;
                report.cancelled = run.cancel.is_cancelled();
                self.assemble_in_order(job, &claims.candidates, completions, &assembler, &mut report);

                if report.cancelled {
                    warn!("⏹️ Episode cancelled, nothing committed");
                    run.emitted.release(claims.claimed_words());
                } else {
                    // Only words that became cards stay claimed for later episodes
                    run.emitted.release(report.failures.iter().map(|f| f.word.as_str()));
                    self.commit(&mut report, &run.emitted).await;
                }
            }
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        let outcome = if report.is_success() {
            Outcome::Ok
        } else if report.cancelled {
            Outcome::Failed(FailureKind::Cancelled)
        } else {
            Outcome::Failed(FailureKind::ServiceError)
        };
        self.emit(PipelineEvent::stage(Stage::Episode, outcome));

        info!(
            "✅ Episode finished in {:.2}s: {} cards, {} previews, {} failures, {} duplicates",
            report.elapsed_secs,
            report.cards.len(),
            report.previews.len(),
            report.failures.len(),
            report.duplicates.len()
        );
        Ok(report)
    }

    async fn preview(
        &self,
        candidates: &[MiningUnit],
        assembler: &CardAssembler,
        cancel: &CancellationToken,
        report: &mut EpisodeReport,
    ) {
        let resolved: Vec<(&MiningUnit, Result<Definition>)> = stream::iter(candidates)
            .map(|unit| async move {
                if cancel.is_cancelled() {
                    return (unit, Err(MiningError::Cancelled));
                }
                let result = tokio::select! {
                    result = self.resolver.resolve(&unit.token.base_form) => result,
                    _ = cancel.cancelled() => return (unit, Err(MiningError::Cancelled)),
                };
                self.emit(PipelineEvent::unit(
                    Stage::Define,
                    unit.index,
                    outcome_of(&result),
                ));
                (unit, result)
            })
            .buffered(self.workers)
            .collect()
            .await;

        for (unit, result) in resolved {
            match &result {
                Err(MiningError::Cancelled) => continue,
                Err(e) => report.failures.push(UnitFailure::new(unit, Stage::Define, e)),
                Ok(_) => {}
            }
            report.previews.push(assembler.preview(unit, result.as_ref().ok()));
        }
    }

    /// Run every candidate through definition lookup and media extraction.
    ///
    /// Returns the completion map keyed by unit index; arrival order is arbitrary.
    async fn dispatch(
        &self,
        job: &EpisodeJob,
        candidates: &[MiningUnit],
        cancel: &CancellationToken,
    ) -> HashMap<usize, UnitResult> {
        let mut completions = HashMap::with_capacity(candidates.len());
        let (tx, mut rx) = mpsc::channel(self.workers.max(1));

        for unit in candidates {
            if cancel.is_cancelled() {
                completions.insert(
                    unit.index,
                    UnitResult::Failed {
                        stage: Stage::Extract,
                        error: MiningError::Cancelled,
                    },
                );
                continue;
            }

            let worker = UnitWorker {
                unit: unit.clone(),
                video: job.video_path.clone(),
                resolver: Arc::clone(&self.resolver),
                extractor: Arc::clone(&self.extractor),
                pool: Arc::clone(&self.worker_pool),
                cancel: cancel.clone(),
                events: Arc::clone(&self.events),
                grace: self.cancel_grace,
            };
            let tx = tx.clone();

            tokio::spawn(async move {
                let index = worker.unit.index;
                let result = worker.run().await;
                if let Err(e) = tx.send((index, result)).await {
                    error!("Failed to send result for unit {}: {}", index, e);
                }
            });
        }

        // Close the channel once every worker is done
        drop(tx);

        while let Some((index, result)) = rx.recv().await {
            completions.insert(index, result);
        }
        completions
    }

    /// Final ordered pass over the candidates, so cards follow cue order
    fn assemble_in_order(
        &self,
        job: &EpisodeJob,
        candidates: &[MiningUnit],
        mut completions: HashMap<usize, UnitResult>,
        assembler: &CardAssembler,
        report: &mut EpisodeReport,
    ) {
        for unit in candidates {
            let failure = match completions.remove(&unit.index) {
                Some(UnitResult::Ready { .. }) if report.cancelled => {
                    Some((Stage::Assemble, MiningError::Cancelled))
                }
                Some(UnitResult::Ready { definition, media }) => {
                    if media.reused {
                        report.media_reused += 1;
                    }
                    match assembler.assemble(&job.video_path, &definition, &media) {
                        Ok(card) => {
                            self.emit(PipelineEvent::unit(Stage::Assemble, unit.index, Outcome::Ok));
                            report.cards.push(card);
                            None
                        }
                        Err(e) => Some((Stage::Assemble, e)),
                    }
                }
                Some(UnitResult::Failed { stage, error }) => Some((stage, error)),
                None => Some((
                    Stage::Extract,
                    MiningError::Backend("worker ended without a result".to_string()),
                )),
            };

            if let Some((stage, error)) = failure {
                debug!("Unit {} ({}) dropped: {}", unit.index, unit.token.base_form, error);
                if stage == Stage::Assemble {
                    self.emit(PipelineEvent::unit(stage, unit.index, Outcome::Failed(error.kind())));
                }
                report.failures.push(UnitFailure::new(unit, stage, &error));
            }
        }
    }

    /// Send the cards; words of cards that were not created are released from the ledger
    async fn commit(&self, report: &mut EpisodeReport, emitted: &EmittedWords) {
        if report.cards.is_empty() {
            debug!("No cards to commit");
            return;
        }

        self.emit(PipelineEvent::stage(Stage::Commit, Outcome::Started));
        let outcome = match self.cards.create_cards(&report.cards).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("❌ Card commit failed: {}", e);
                self.emit(PipelineEvent::stage(Stage::Commit, Outcome::Failed(e.kind())));
                report.commit_error = Some(e.to_string());
                report.uncommitted = report.cards.iter().map(|c| c.word.clone()).collect();
                emitted.release(&report.uncommitted);
                return;
            }
        };

        let mut created = Vec::new();
        let mut rejected = Vec::new();
        for (i, card) in report.cards.iter().enumerate() {
            match outcome.id_for(i) {
                Some(_) => created.push(card.word.clone()),
                None => rejected.push(card.word.clone()),
            }
        }
        report.card_ids = outcome.created();
        info!("📤 Committed {} of {} cards", created.len(), report.cards.len());

        if let Some(store) = &self.known_store {
            if let Err(e) = store.add_mined(&created).await {
                warn!("Failed to record mined words: {}", e);
            }
        }

        if rejected.is_empty() {
            self.emit(PipelineEvent::stage(Stage::Commit, Outcome::Ok));
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| format!("{} card(s) not created", rejected.len()));
            error!("❌ Card commit incomplete: {}", message);
            self.emit(PipelineEvent::stage(
                Stage::Commit,
                Outcome::Failed(FailureKind::ServiceError),
            ));
            report.commit_error = Some(message);
            emitted.release(&rejected);
            report.uncommitted = rejected;
        }
    }
}

/// Everything one spawned unit task needs
struct UnitWorker {
    unit: MiningUnit,
    video: PathBuf,
    resolver: Arc<DictionaryResolver>,
    extractor: Arc<MediaExtractor>,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
    events: Arc<dyn EventSink>,
    grace: Duration,
}

impl UnitWorker {
    async fn run(&self) -> UnitResult {
        let work = async { tokio::join!(self.define(), self.extract()) };
        let deadline = async {
            self.cancel.cancelled().await;
            tokio::time::sleep(self.grace).await;
        };

        // Past the grace period the work future is dropped, which kills its processes
        let (definition, media) = tokio::select! {
            results = work => results,
            _ = deadline => {
                return UnitResult::Failed {
                    stage: Stage::Extract,
                    error: ExtractionError::Cancelled.into(),
                };
            }
        };

        match (definition, media) {
            (_, Err(ExtractionError::Cancelled)) => UnitResult::Failed {
                stage: Stage::Extract,
                error: ExtractionError::Cancelled.into(),
            },
            (Err(error), _) => UnitResult::Failed {
                stage: Stage::Define,
                error,
            },
            (Ok(_), Err(error)) => UnitResult::Failed {
                stage: Stage::Extract,
                error: error.into(),
            },
            (Ok(definition), Ok(media)) => UnitResult::Ready { definition, media },
        }
    }

    async fn define(&self) -> Result<Definition> {
        let result = self.resolver.resolve(&self.unit.token.base_form).await;
        self.events.emit(PipelineEvent::unit(
            Stage::Define,
            self.unit.index,
            outcome_of(&result),
        ));
        result
    }

    async fn extract(&self) -> ExtractionResult<MediaArtifact> {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.pool).acquire_owned() => {
                permit.map_err(|_| ExtractionError::Cancelled)?
            }
            _ = self.cancel.cancelled() => return Err(ExtractionError::Cancelled),
        };
        if self.cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        self.events
            .emit(PipelineEvent::unit(Stage::Extract, self.unit.index, Outcome::Started));
        let result = self.extractor.extract(&self.video, &self.unit).await;
        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(e) => {
                warn!(
                    "Extraction failed for {} at {:.2}s: {}",
                    self.unit.token.base_form,
                    self.unit.effective_start.as_secs_f64(),
                    e
                );
                Outcome::Failed(e.kind())
            }
        };
        self.events
            .emit(PipelineEvent::unit(Stage::Extract, self.unit.index, outcome));
        result
    }
}

/// Take one known-word snapshot for the whole run
pub async fn load_known_words(source: &dyn KnownWordsSource) -> Result<KnownWords> {
    let words = source.known_words().await?;
    info!("📚 {} known words loaded", words.len());
    Ok(KnownWords::new(words))
}

/// Write a report as pretty JSON
pub async fn write_report<T: Serialize>(report: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(path, json).await?;
    info!("💾 Report saved to: {}", path.display());
    Ok(())
}
