use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::config::{MediaConfig, TimingConfig};
use crate::cues::{MiningUnit, Offset};
use crate::error::ExtractionError;

pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;

const JAPANESE_TAGS: [&str; 4] = ["jpn", "ja", "japanese", "jp"];

/// An audio stream as reported by ffprobe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Absolute stream index, usable as `-map 0:{index}`
    pub index: usize,
    pub language: Option<String>,
    pub is_default: bool,
}

impl AudioTrack {
    pub fn is_japanese(&self) -> bool {
        self.language
            .as_deref()
            .map(|l| JAPANESE_TAGS.iter().any(|tag| l.eq_ignore_ascii_case(tag)))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoProbe {
    /// Zero when the container does not report a duration
    pub duration: Duration,
    pub audio_tracks: Vec<AudioTrack>,
}

impl VideoProbe {
    /// Japanese-tagged track, else the default track, else the first
    pub fn preferred_audio_track(&self) -> Option<&AudioTrack> {
        self.audio_tracks
            .iter()
            .find(|t| t.is_japanese())
            .or_else(|| self.audio_tracks.iter().find(|t| t.is_default))
            .or_else(|| self.audio_tracks.first())
    }

    pub fn from_ffprobe_json(json: &str, video: &Path) -> ExtractionResult<Self> {
        let probe_error = |message: String| ExtractionError::Probe {
            path: video.to_path_buf(),
            message,
        };

        let data: serde_json::Value =
            serde_json::from_str(json).map_err(|e| probe_error(format!("invalid ffprobe output: {}", e)))?;

        let duration = data["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default();

        let audio_tracks = data["streams"]
            .as_array()
            .map(|streams| {
                streams
                    .iter()
                    .filter(|s| s["codec_type"] == "audio")
                    .filter_map(|s| {
                        Some(AudioTrack {
                            index: s["index"].as_u64()? as usize,
                            language: s["tags"]["language"].as_str().map(|l| l.to_string()),
                            is_default: s["disposition"]["default"].as_u64() == Some(1),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { duration, audio_tracks })
    }
}

/// Process-based media capabilities
#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe(&self, video: &Path) -> ExtractionResult<VideoProbe>;

    async fn capture_screenshot(&self, video: &Path, at: Duration, output: &Path) -> ExtractionResult<()>;

    async fn capture_audio(
        &self,
        video: &Path,
        start: Duration,
        length: Duration,
        track: &AudioTrack,
        output: &Path,
    ) -> ExtractionResult<()>;
}

/// `MediaTool` backed by the ffmpeg and ffprobe binaries
pub struct FfmpegTool {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
    jpeg_quality: u32,
    mp3_quality: u32,
}

fn seconds_arg(at: Duration) -> String {
    format!("{:.3}", at.as_secs_f64())
}

/// Arguments for a single JPEG frame at `at`
pub fn screenshot_args(video: &Path, at: Duration, quality: u32, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        seconds_arg(at),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-q:v".to_string(),
        quality.to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Arguments for an MP3 clip of `length` from `start` using one audio stream
pub fn audio_args(
    video: &Path,
    start: Duration,
    length: Duration,
    stream_index: usize,
    quality: u32,
    output: &Path,
) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        seconds_arg(start),
        "-t".to_string(),
        seconds_arg(length),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-map".to_string(),
        format!("0:{}", stream_index),
        "-vn".to_string(),
        "-acodec".to_string(),
        "libmp3lame".to_string(),
        "-q:a".to_string(),
        quality.to_string(),
        output.to_string_lossy().to_string(),
    ]
}

impl FfmpegTool {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            timeout: Duration::from_secs(config.process_timeout_secs.max(1)),
            jpeg_quality: config.jpeg_quality,
            mp3_quality: config.mp3_quality,
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> ExtractionResult<Vec<u8>> {
        debug!("Running {} {}", program, args.join(" "));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ExtractionError::Timeout {
                program: program.to_string(),
                after: self.timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            return Err(ExtractionError::ProcessFailed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: tail.into_iter().rev().collect::<Vec<_>>().join(" | "),
            });
        }

        Ok(output.stdout)
    }

    /// Write through a temporary sibling file; only a finished output is moved into place
    async fn write_via_temp(&self, output: &Path, args: impl FnOnce(&Path) -> Vec<String>) -> ExtractionResult<()> {
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let suffix = output
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let temp_path = tempfile::Builder::new()
            .prefix(".partial-")
            .suffix(&suffix)
            .tempfile_in(dir)?
            .into_temp_path();

        self.run(&self.ffmpeg, &args(&temp_path)).await?;

        let written = tokio::fs::metadata(&temp_path).await?.len();
        if written == 0 {
            return Err(ExtractionError::ProcessFailed {
                program: self.ffmpeg.clone(),
                status: "success".to_string(),
                stderr: format!("no output written for {}", output.display()),
            });
        }

        temp_path.persist(output).map_err(|e| ExtractionError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn probe(&self, video: &Path) -> ExtractionResult<VideoProbe> {
        let args = [
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(video.to_string_lossy().to_string()))
        .collect::<Vec<_>>();

        let stdout = self.run(&self.ffprobe, &args).await?;
        VideoProbe::from_ffprobe_json(&String::from_utf8_lossy(&stdout), video)
    }

    async fn capture_screenshot(&self, video: &Path, at: Duration, output: &Path) -> ExtractionResult<()> {
        let quality = self.jpeg_quality;
        self.write_via_temp(output, |temp| screenshot_args(video, at, quality, temp))
            .await
    }

    async fn capture_audio(
        &self,
        video: &Path,
        start: Duration,
        length: Duration,
        track: &AudioTrack,
        output: &Path,
    ) -> ExtractionResult<()> {
        let quality = self.mp3_quality;
        let index = track.index;
        self.write_via_temp(output, |temp| audio_args(video, start, length, index, quality, temp))
            .await
    }
}

/// Screenshot and audio clip produced for one mining unit
#[derive(Debug, Clone, PartialEq)]
pub struct MediaArtifact {
    pub screenshot_path: PathBuf,
    pub audio_path: PathBuf,
    pub unit: MiningUnit,
    /// Both files already existed and no process ran
    pub reused: bool,
}

/// Produces content-addressed screenshots and clips, caching per-video metadata
pub struct MediaExtractor {
    tool: Arc<dyn MediaTool>,
    media_dir: PathBuf,
    screenshot_offset: Offset,
    audio_padding: Duration,
    probes: Mutex<HashMap<PathBuf, Arc<OnceCell<Arc<VideoProbe>>>>>,
    video_ids: Mutex<HashMap<PathBuf, String>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MediaExtractor {
    pub fn new(tool: Arc<dyn MediaTool>, media_dir: PathBuf, timing: &TimingConfig) -> Self {
        Self {
            tool,
            media_dir,
            screenshot_offset: Offset::from_secs_f64(timing.screenshot_offset),
            audio_padding: Duration::from_millis(Offset::from_secs_f64(timing.audio_padding).as_millis().max(0) as u64),
            probes: Mutex::new(HashMap::new()),
            video_ids: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Stable identity for a video: md5 of its canonical path and size
    pub async fn video_id(&self, video: &Path) -> ExtractionResult<String> {
        if let Some(id) = self.video_ids.lock().await.get(video) {
            return Ok(id.clone());
        }

        let canonical = tokio::fs::canonicalize(video).await?;
        let size = tokio::fs::metadata(&canonical).await?.len();
        let digest = md5::compute(format!("{}:{}", canonical.display(), size));
        let id = format!("{:x}", digest)[..16].to_string();

        self.video_ids.lock().await.insert(video.to_path_buf(), id.clone());
        Ok(id)
    }

    /// Output paths for a unit, keyed by video id and millisecond timestamp
    pub fn artifact_paths(&self, video_id: &str, at: Duration) -> (PathBuf, PathBuf) {
        let stem = format!("{}_{:010}", video_id, at.as_millis());
        (
            self.media_dir.join(format!("{}.jpg", stem)),
            self.media_dir.join(format!("{}.mp3", stem)),
        )
    }

    /// Probe once per video; concurrent callers share the first probe
    pub async fn probe(&self, video: &Path) -> ExtractionResult<Arc<VideoProbe>> {
        let cell = {
            let mut probes = self.probes.lock().await;
            Arc::clone(probes.entry(video.to_path_buf()).or_default())
        };

        let probe = cell
            .get_or_try_init(|| async {
                let probe = self.tool.probe(video).await?;
                info!(
                    "🎬 Probed {}: {:.1}s, {} audio track(s)",
                    video.display(),
                    probe.duration.as_secs_f64(),
                    probe.audio_tracks.len()
                );
                Ok::<_, ExtractionError>(Arc::new(probe))
            })
            .await?;
        Ok(Arc::clone(probe))
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    pub async fn extract(&self, video: &Path, unit: &MiningUnit) -> ExtractionResult<MediaArtifact> {
        let video_id = self.video_id(video).await?;
        let (screenshot_path, audio_path) = self.artifact_paths(&video_id, unit.effective_start);

        let key = format!("{}_{}", video_id, unit.effective_start.as_millis());
        let lock = self.key_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.extract_locked(video, unit, screenshot_path, audio_path).await
        };
        self.release_key_lock(&key, lock).await;
        result
    }

    /// Drop a key's lock once no other extraction holds or waits on it
    async fn release_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().await;
        drop(lock);
        if locks.get(key).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Keys with an extraction in progress
    pub async fn active_keys(&self) -> usize {
        self.key_locks.lock().await.len()
    }

    async fn extract_locked(
        &self,
        video: &Path,
        unit: &MiningUnit,
        screenshot_path: PathBuf,
        audio_path: PathBuf,
    ) -> ExtractionResult<MediaArtifact> {
        let screenshot_done = is_non_empty(&screenshot_path).await;
        let audio_done = is_non_empty(&audio_path).await;
        if screenshot_done && audio_done {
            debug!("Reusing media for {} at {:?}", unit.token.base_form, unit.effective_start);
            return Ok(MediaArtifact {
                screenshot_path,
                audio_path,
                unit: unit.clone(),
                reused: true,
            });
        }

        let probe = self.probe(video).await?;
        let known_duration = (!probe.duration.is_zero()).then_some(probe.duration);
        if let Some(duration) = known_duration {
            if unit.effective_start > duration {
                return Err(ExtractionError::OutOfRange {
                    timestamp: unit.effective_start,
                    duration,
                });
            }
        }
        let track = probe
            .preferred_audio_track()
            .ok_or_else(|| ExtractionError::MissingAudioTrack(video.to_path_buf()))?;

        tokio::fs::create_dir_all(&self.media_dir).await?;

        if !screenshot_done {
            let mut at = self.screenshot_offset.apply(unit.effective_start);
            if let Some(duration) = known_duration {
                at = at.min(duration.saturating_sub(Duration::from_millis(100)));
            }
            self.tool.capture_screenshot(video, at, &screenshot_path).await?;
        }

        if !audio_done {
            let start = unit.effective_start.saturating_sub(self.audio_padding);
            let mut end = unit.effective_end + self.audio_padding;
            if let Some(duration) = known_duration {
                end = end.min(duration);
            }
            if end <= start {
                return Err(ExtractionError::OutOfRange {
                    timestamp: unit.effective_start,
                    duration: probe.duration,
                });
            }
            self.tool
                .capture_audio(video, start, end - start, track, &audio_path)
                .await?;
        }

        Ok(MediaArtifact {
            screenshot_path,
            audio_path,
            unit: unit.clone(),
            reused: false,
        })
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
