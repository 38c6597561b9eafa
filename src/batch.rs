use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::BatchConfig;
use crate::cues::Offset;
use crate::error::{FailureKind, MiningError, Result};
use crate::filter::EpisodeCounts;
use crate::pipeline::{EpisodeJob, EpisodeReport, MiningPipeline, RunContext, RunMode};
use crate::progress::{EventSink, Outcome, PipelineEvent, Stage, TracingSink};
use crate::text::natural_sort_key;

static SEASON_EPISODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[Ss](\d+)[\s._-]*[Ee](\d+)").unwrap());
static CROSS_EPISODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)[xX](\d+)").unwrap());
static EPISODE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[Ee][Pp](?:isode)?[\s._-]*(\d+)").unwrap());
static BARE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^\d])(\d{1,3})(?:[^\d]|$)").unwrap());
static BRACKET_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").unwrap());
static TRAILING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s._-]*\d+\s*$").unwrap());
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s._-]+").unwrap());

/// Season and episode numbers read from a file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeNumber {
    pub season: Option<u32>,
    pub episode: u32,
}

impl EpisodeNumber {
    /// Patterns in priority order: S01E02, 1x02, Ep 02, then a bare 1-3 digit number
    pub fn from_stem(stem: &str) -> Option<Self> {
        if let Some(caps) = SEASON_EPISODE.captures(stem) {
            return Some(Self {
                season: caps[1].parse().ok(),
                episode: caps[2].parse().ok()?,
            });
        }
        if let Some(caps) = CROSS_EPISODE.captures(stem) {
            return Some(Self {
                season: caps[1].parse().ok(),
                episode: caps[2].parse().ok()?,
            });
        }
        if let Some(caps) = EPISODE_WORD.captures(stem) {
            return Some(Self {
                season: None,
                episode: caps[1].parse().ok()?,
            });
        }
        BARE_NUMBER.captures(stem).and_then(|caps| {
            Some(Self {
                season: None,
                episode: caps[1].parse().ok()?,
            })
        })
    }

    /// Same episode, and same season when both sides carry one
    pub fn matches(&self, other: &EpisodeNumber) -> bool {
        self.episode == other.episode
            && match (self.season, other.season) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Series name from a file stem with tags and episode markers removed
pub fn infer_series_name(video: &Path) -> String {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut name = BRACKET_TAG.replace_all(&stem, " ").to_string();
    for pattern in [&*SEASON_EPISODE, &*CROSS_EPISODE, &*EPISODE_WORD] {
        if let Some(found) = pattern.find(&name) {
            name.truncate(found.start());
            break;
        }
    }
    let name = TRAILING_NUMBER.replace(&name, "");
    let name = SEPARATORS.replace_all(&name, " ").trim().to_string();

    if !name.is_empty() {
        return name;
    }
    video
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unsorted".to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredFiles {
    pub videos: Vec<PathBuf>,
    pub subtitles: Vec<PathBuf>,
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

fn lower_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Walk `root` for video and subtitle files, sorted by path
pub async fn discover(root: &Path, config: &BatchConfig) -> Result<DiscoveredFiles> {
    if !root.is_dir() {
        return Err(MiningError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        )));
    }

    let root = root.to_path_buf();
    let videos_ext: HashSet<String> = config.video_extensions.iter().map(|e| e.to_lowercase()).collect();
    let subtitle_ext: HashSet<String> = config.subtitle_extensions.iter().map(|e| e.to_lowercase()).collect();

    tokio::task::spawn_blocking(move || {
        let mut found = DiscoveredFiles::default();
        for entry in WalkDir::new(&root).follow_links(true).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            match extension_of(&path) {
                Some(ext) if videos_ext.contains(&ext) => found.videos.push(path),
                Some(ext) if subtitle_ext.contains(&ext) => found.subtitles.push(path),
                _ => {}
            }
        }
        found.videos.sort();
        found.subtitles.sort();
        found
    })
    .await
    .map_err(|e| MiningError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl PairingFailure {
    fn new(path: &Path, message: impl Into<String>) -> Self {
        let error = MiningError::Pairing {
            path: path.to_path_buf(),
            message: message.into(),
        };
        Self {
            path: path.to_path_buf(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub video: PathBuf,
    pub subtitle: PathBuf,
}

/// Pair each video with one subtitle.
///
/// Exact stem matches come first (same directory, then a unique match anywhere,
/// subtitle extensions tried in configured order). Videos still unpaired fall back
/// to a unique episode-number match. Leftover files become pairing failures.
pub fn pair_files(files: &DiscoveredFiles, config: &BatchConfig) -> (Vec<FilePair>, Vec<PairingFailure>) {
    let ext_rank = |path: &Path| {
        let ext = extension_of(path).unwrap_or_default();
        config
            .subtitle_extensions
            .iter()
            .position(|e| e.eq_ignore_ascii_case(&ext))
            .unwrap_or(usize::MAX)
    };

    let mut used: HashSet<&PathBuf> = HashSet::new();
    let mut pairs = Vec::new();
    let mut unpaired_videos = Vec::new();

    for video in &files.videos {
        let stem = lower_stem(video);
        let mut same_stem: Vec<&PathBuf> = files
            .subtitles
            .iter()
            .filter(|s| !used.contains(s) && lower_stem(s) == stem)
            .collect();
        same_stem.sort_by_key(|s| ext_rank(s));

        let local = same_stem.iter().find(|s| s.parent() == video.parent()).copied();
        let chosen = match local {
            Some(subtitle) => Some(subtitle),
            None if same_stem.len() == 1 => Some(same_stem[0]),
            None => None,
        };

        match chosen {
            Some(subtitle) => {
                used.insert(subtitle);
                pairs.push(FilePair {
                    video: video.clone(),
                    subtitle: subtitle.clone(),
                });
            }
            None => unpaired_videos.push(video),
        }
    }

    let mut failures = Vec::new();
    for video in unpaired_videos {
        let number = video
            .file_stem()
            .and_then(|s| EpisodeNumber::from_stem(&s.to_string_lossy()));
        let candidates: Vec<&PathBuf> = match number {
            Some(number) => files
                .subtitles
                .iter()
                .filter(|s| !used.contains(s) && s.parent() == video.parent())
                .filter(|s| {
                    s.file_stem()
                        .and_then(|stem| EpisodeNumber::from_stem(&stem.to_string_lossy()))
                        .map(|n| n.matches(&number))
                        .unwrap_or(false)
                })
                .collect(),
            None => Vec::new(),
        };

        if candidates.len() == 1 {
            used.insert(candidates[0]);
            pairs.push(FilePair {
                video: video.clone(),
                subtitle: candidates[0].clone(),
            });
        } else if candidates.len() > 1 {
            failures.push(PairingFailure::new(
                video,
                format!("{} subtitles share its episode number", candidates.len()),
            ));
        } else {
            failures.push(PairingFailure::new(video, "no matching subtitle"));
        }
    }

    for subtitle in files.subtitles.iter().filter(|s| !used.contains(s)) {
        failures.push(PairingFailure::new(subtitle, "no matching video"));
    }

    (pairs, failures)
}

/// Episodes of one series, in natural filename order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesQueue {
    pub name: String,
    pub offset_secs: f64,
    pub jobs: Vec<EpisodeJob>,
}

/// Group pairs by inferred series name and attach the per-series offset
pub fn group_series(pairs: Vec<FilePair>, config: &BatchConfig) -> Vec<SeriesQueue> {
    let mut grouped: BTreeMap<String, Vec<FilePair>> = BTreeMap::new();
    for pair in pairs {
        grouped.entry(infer_series_name(&pair.video)).or_default().push(pair);
    }

    grouped
        .into_iter()
        .map(|(name, mut pairs)| {
            pairs.sort_by_cached_key(|p| {
                natural_sort_key(&p.video.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default())
            });
            let offset_secs = config
                .series_offsets
                .iter()
                .find(|(series, _)| series.eq_ignore_ascii_case(&name))
                .map(|(_, offset)| *offset)
                .unwrap_or(0.0);
            let offset = Offset::from_secs_f64(offset_secs);
            let jobs = pairs
                .into_iter()
                .map(|p| EpisodeJob::new(p.video, p.subtitle, offset))
                .collect();
            SeriesQueue {
                name,
                offset_secs,
                jobs,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchState {
    Discovering,
    Pairing,
    EpisodeRunning { index: usize, total: usize },
    Completed { partial: bool },
}

/// Episode-fatal failure such as an unparseable subtitle file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeError {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeEntry {
    pub series: String,
    pub video: PathBuf,
    pub subtitle: PathBuf,
    pub report: Option<EpisodeReport>,
    /// Set when the episode failed before producing a report
    pub error: Option<EpisodeError>,
}

impl EpisodeEntry {
    fn succeeded(&self) -> bool {
        self.report.as_ref().map(|r| r.is_success()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub root: PathBuf,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub state: BatchState,
    pub series: Vec<String>,
    pub episodes: Vec<EpisodeEntry>,
    pub pairing_failures: Vec<PairingFailure>,
    pub total_cards: usize,
    pub total_unit_failures: usize,
    pub cancelled: bool,
    pub elapsed_secs: f64,
}

impl BatchReport {
    pub fn is_partial(&self) -> bool {
        matches!(self.state, BatchState::Completed { partial: true })
    }
}

/// Discovers episode pairs under a folder and mines them one at a time
pub struct BatchCoordinator<'a> {
    pipeline: &'a MiningPipeline,
    config: BatchConfig,
    events: Arc<dyn EventSink>,
    state: BatchState,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(pipeline: &'a MiningPipeline, config: BatchConfig) -> Self {
        Self {
            pipeline,
            config,
            events: Arc::new(TracingSink),
            state: BatchState::Discovering,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    fn transition(&mut self, state: BatchState) {
        info!("Batch state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Number of episodes each base form appears in; unreadable subtitles are skipped
    async fn count_appearances(&self, queues: &[SeriesQueue], run: &RunContext) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for job in queues.iter().flat_map(|q| &q.jobs) {
            if run.cancel.is_cancelled() {
                break;
            }
            match self.pipeline.scan_base_forms(&job.subtitle_path).await {
                Ok(words) => {
                    for word in words {
                        *counts.entry(word).or_insert(0) += 1;
                    }
                }
                Err(e) => warn!("Appearance scan skipped {}: {}", job.subtitle_path.display(), e),
            }
        }
        counts
    }

    /// Run every paired episode sequentially, sharing `run` across episodes
    pub async fn run(&mut self, root: &Path, run: &RunContext) -> Result<BatchReport> {
        let started = Instant::now();
        let started_at = Utc::now();

        self.transition(BatchState::Discovering);
        self.events.emit(PipelineEvent::stage(Stage::Discover, Outcome::Started));
        info!("🔍 Discovering episodes under {}", root.display());
        let files = discover(root, &self.config).await?;
        info!(
            "📹 Found {} videos and {} subtitles",
            files.videos.len(),
            files.subtitles.len()
        );
        self.events.emit(PipelineEvent::stage(Stage::Discover, Outcome::Ok));

        self.transition(BatchState::Pairing);
        let (pairs, pairing_failures) = pair_files(&files, &self.config);
        for failure in &pairing_failures {
            warn!("⚠️ {}", failure.message);
            self.events
                .emit(PipelineEvent::stage(Stage::Pair, Outcome::Failed(FailureKind::PairingError)));
        }
        let queues = group_series(pairs, &self.config);
        let total: usize = queues.iter().map(|q| q.jobs.len()).sum();
        info!("🗂️ {} episodes in {} series", total, queues.len());
        self.events.emit(PipelineEvent::stage(Stage::Pair, Outcome::Ok));

        let run = match self.config.min_episode_appearances {
            0 | 1 => run.clone(),
            min => {
                let counts = self.count_appearances(&queues, run).await;
                let common = counts.values().filter(|&&c| c >= min).count();
                info!("📈 {} words appear in {}+ episodes", common, min);
                run.clone().with_episode_counts(EpisodeCounts::new(counts, min))
            }
        };
        let run = &run;

        let mut episodes = Vec::with_capacity(total);
        let mut index = 0;
        'series: for queue in &queues {
            for job in &queue.jobs {
                if run.cancel.is_cancelled() {
                    warn!("⏹️ Batch cancelled before {}", job.video_path.display());
                    break 'series;
                }

                index += 1;
                self.transition(BatchState::EpisodeRunning { index, total });
                info!("📹 Episode {}/{} [{}]: {}", index, total, queue.name, job.video_path.display());

                let entry = match self.pipeline.run_episode(job, run).await {
                    Ok(report) => EpisodeEntry {
                        series: queue.name.clone(),
                        video: job.video_path.clone(),
                        subtitle: job.subtitle_path.clone(),
                        report: Some(report),
                        error: None,
                    },
                    Err(e) => {
                        error!("❌ Episode failed: {} - {}", job.video_path.display(), e);
                        EpisodeEntry {
                            series: queue.name.clone(),
                            video: job.video_path.clone(),
                            subtitle: job.subtitle_path.clone(),
                            report: None,
                            error: Some(EpisodeError {
                                kind: e.kind(),
                                message: e.to_string(),
                            }),
                        }
                    }
                };
                episodes.push(entry);
            }
        }

        let cancelled = run.cancel.is_cancelled();
        let partial = cancelled || episodes.iter().any(|e| !e.succeeded());
        self.transition(BatchState::Completed { partial });

        let reports = episodes.iter().filter_map(|e| e.report.as_ref());
        let total_cards = reports.clone().map(|r| r.committed_cards()).sum();
        let total_unit_failures = reports.map(|r| r.failures.len()).sum();

        info!(
            "🎉 Batch finished in {:.2}s: {} episodes, {} cards, {} pairing failures{}",
            started.elapsed().as_secs_f64(),
            episodes.len(),
            total_cards,
            pairing_failures.len(),
            if partial { " (partial)" } else { "" }
        );

        Ok(BatchReport {
            root: root.to_path_buf(),
            mode: run.mode,
            started_at,
            state: self.state.clone(),
            series: queues.iter().map(|q| q.name.clone()).collect(),
            episodes,
            pairing_failures,
            total_cards,
            total_unit_failures,
            cancelled,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(root: &Path, names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| root.join(n)).collect()
    }

    #[test]
    fn test_episode_number_patterns() {
        let cases = [
            ("Show.S02E05.1080p", Some(2), 5),
            ("show 1x07", Some(1), 7),
            ("Show - Episode 12", None, 12),
            ("show_ep.03", None, 3),
            ("Show 04 [BD]", None, 4),
        ];
        for (stem, season, episode) in cases {
            let number = EpisodeNumber::from_stem(stem).unwrap();
            assert_eq!((number.season, number.episode), (season, episode), "{}", stem);
        }
        assert!(EpisodeNumber::from_stem("no numbers here").is_none());
    }

    #[test]
    fn test_infer_series_name() {
        assert_eq!(infer_series_name(Path::new("/a/[Group] Frieren - 05 [1080p].mkv")), "Frieren");
        assert_eq!(infer_series_name(Path::new("/a/Show.Name.S01E02.mkv")), "Show Name");
        assert_eq!(infer_series_name(Path::new("/anime/Bocchi/03.mkv")), "Bocchi");
    }

    #[test]
    fn test_pairing_by_stem_and_episode_number() {
        let root = Path::new("/library");
        let files = DiscoveredFiles {
            videos: paths(root, &["show/Show 01.mkv", "show/Show 02.mkv", "show/Show S01E03.mkv", "lonely.mp4"]),
            subtitles: paths(
                root,
                &["show/show 01.srt", "show/Show 01.ass", "subs/Show 02.srt", "show/jp_ep03.ass", "orphan.srt"],
            ),
        };
        let (pairs, failures) = pair_files(&files, &BatchConfig::default());

        assert_eq!(pairs.len(), 3);
        // ass ranks before srt in the default extension order
        assert_eq!(pairs[0].subtitle, root.join("show/Show 01.ass"));
        assert_eq!(pairs[1].subtitle, root.join("subs/Show 02.srt"));
        assert_eq!(pairs[2].subtitle, root.join("show/jp_ep03.ass"));

        let failed: Vec<&PathBuf> = failures.iter().map(|f| &f.path).collect();
        assert!(failed.contains(&&root.join("lonely.mp4")));
        assert!(failed.contains(&&root.join("orphan.srt")));
        assert!(failed.contains(&&root.join("show/show 01.srt")));
        assert!(failures.iter().all(|f| f.kind == FailureKind::PairingError));
    }

    #[test]
    fn test_group_series_applies_offsets_and_natural_order() {
        let config = BatchConfig {
            series_offsets: [("frieren".to_string(), -1.5)].into_iter().collect(),
            ..BatchConfig::default()
        };
        let pairs = ["Frieren 10", "Frieren 2", "Frieren 1"]
            .iter()
            .map(|name| FilePair {
                video: PathBuf::from(format!("/a/{}.mkv", name)),
                subtitle: PathBuf::from(format!("/a/{}.srt", name)),
            })
            .collect();

        let queues = group_series(pairs, &config);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].offset_secs, -1.5);
        let order: Vec<_> = queues[0].jobs.iter().map(|j| j.video_path.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/a/Frieren 1.mkv"),
                PathBuf::from("/a/Frieren 2.mkv"),
                PathBuf::from("/a/Frieren 10.mkv")
            ]
        );
        assert_eq!(queues[0].jobs[0].offset, Offset::from_millis(-1500));
    }

    #[tokio::test]
    async fn test_discover_filters_extensions() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("season1");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        for name in ["ep01.MKV", "ep01.srt", "notes.txt"] {
            tokio::fs::write(nested.join(name), b"x").await.unwrap();
        }

        let files = discover(temp_dir.path(), &BatchConfig::default()).await.unwrap();
        assert_eq!(files.videos, vec![nested.join("ep01.MKV")]);
        assert_eq!(files.subtitles, vec![nested.join("ep01.srt")]);

        assert!(discover(&temp_dir.path().join("missing"), &BatchConfig::default())
            .await
            .is_err());
    }
}
