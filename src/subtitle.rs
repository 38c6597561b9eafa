use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{MiningError, Result};
use crate::text::clean_subtitle_text;

/// One subtitle line with its display window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub text: String,
    pub start: Duration,
    pub end: Duration,
    pub source_file: PathBuf,
}

impl Cue {
    pub fn new(text: impl Into<String>, start: Duration, end: Duration, source_file: impl Into<PathBuf>) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            source_file: source_file.into(),
        }
    }
}

/// Subtitle formats understood by the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    Srt,
    Ass,
}

impl SubtitleFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "srt" => Some(SubtitleFormat::Srt),
            "ass" | "ssa" => Some(SubtitleFormat::Ass),
            _ => None,
        }
    }
}

/// Reads SRT and ASS/SSA files into cleaned, time-ordered cues
pub struct SubtitleParser;

impl SubtitleParser {
    pub async fn parse_file(path: &Path) -> Result<Vec<Cue>> {
        let format = SubtitleFormat::from_path(path)
            .ok_or_else(|| MiningError::parse(path, "unsupported subtitle extension"))?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| MiningError::parse(path, format!("cannot read file: {}", e)))?;
        let content = String::from_utf8_lossy(&bytes);

        Self::parse_str(&content, format, path)
    }

    pub fn parse_str(content: &str, format: SubtitleFormat, path: &Path) -> Result<Vec<Cue>> {
        let content = content.trim_start_matches('\u{feff}');
        let mut cues = match format {
            SubtitleFormat::Srt => parse_srt(content, path),
            SubtitleFormat::Ass => parse_ass(content, path)?,
        };

        if cues.is_empty() {
            return Err(MiningError::parse(path, "no subtitle cues found"));
        }

        // Stable, so simultaneous cues keep their file order
        cues.sort_by_key(|c| c.start);
        debug!("Parsed {} cues from {}", cues.len(), path.display());
        Ok(cues)
    }
}

fn parse_srt(content: &str, path: &Path) -> Vec<Cue> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut cues = Vec::new();

    for block in normalized.split("\n\n") {
        let mut lines = block.lines().skip_while(|l| !l.contains("-->"));
        let Some(timing) = lines.next() else {
            continue;
        };
        let Some((start, end)) = parse_srt_timing(timing) else {
            debug!("Skipping malformed SRT timing line: {}", timing);
            continue;
        };

        let text = clean_subtitle_text(&lines.collect::<Vec<_>>().join("\n"));
        if !text.is_empty() {
            cues.push(Cue::new(text, start, end, path));
        }
    }

    cues
}

fn parse_srt_timing(line: &str) -> Option<(Duration, Duration)> {
    let (start, rest) = line.split_once("-->")?;
    // Trailing position hints ("X1:...") follow the end time
    let end = rest.split_whitespace().next()?;
    Some((parse_srt_timestamp(start.trim())?, parse_srt_timestamp(end)?))
}

/// HH:MM:SS,mmm (a '.' separator is tolerated)
fn parse_srt_timestamp(timestamp: &str) -> Option<Duration> {
    let (hms, millis) = timestamp.split_once([',', '.'])?;
    let hms_parts: Vec<&str> = hms.split(':').collect();
    if hms_parts.len() != 3 {
        return None;
    }

    let hours: u64 = hms_parts[0].trim().parse().ok()?;
    let minutes: u64 = hms_parts[1].parse().ok()?;
    let seconds: u64 = hms_parts[2].parse().ok()?;
    let millis: u64 = millis.trim().parse().ok()?;

    total_millis(hours, minutes, seconds, millis)
}

fn parse_ass(content: &str, path: &Path) -> Result<Vec<Cue>> {
    let mut in_events = false;
    let mut columns: Option<Vec<String>> = None;
    let mut cues = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_events = line.eq_ignore_ascii_case("[events]");
            continue;
        }
        if !in_events {
            continue;
        }

        if let Some(format) = line.strip_prefix("Format:") {
            columns = Some(
                format
                    .split(',')
                    .map(|c| c.trim().to_lowercase())
                    .collect(),
            );
            continue;
        }

        let Some(dialogue) = line.strip_prefix("Dialogue:") else {
            continue;
        };
        let columns = columns
            .as_ref()
            .ok_or_else(|| MiningError::parse(path, "Dialogue line before Format line"))?;

        let fields: Vec<&str> = dialogue.splitn(columns.len(), ',').collect();
        if fields.len() != columns.len() {
            debug!("Skipping short Dialogue line: {}", line);
            continue;
        }

        let field = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .map(|i| fields[i].trim())
        };

        let (Some(start), Some(end), Some(raw_text)) = (field("start"), field("end"), field("text")) else {
            return Err(MiningError::parse(path, "Format line lacks Start, End or Text"));
        };
        let (Some(start), Some(end)) = (parse_ass_timestamp(start), parse_ass_timestamp(end)) else {
            debug!("Skipping Dialogue with malformed timestamps: {}", line);
            continue;
        };

        let text = clean_subtitle_text(raw_text);
        if !text.is_empty() {
            cues.push(Cue::new(text, start, end, path));
        }
    }

    Ok(cues)
}

/// H:MM:SS.cc
fn parse_ass_timestamp(timestamp: &str) -> Option<Duration> {
    let parts: Vec<&str> = timestamp.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let (secs, frac) = parts[2].split_once('.').unwrap_or((parts[2], "0"));
    let seconds: u64 = secs.parse().ok()?;

    // Centiseconds normally, but accept any fractional precision
    let frac_digits: String = frac.chars().take(3).collect();
    let scale = 10u64.pow(3 - frac_digits.len() as u32);
    let millis = frac_digits.parse::<u64>().ok()? * scale;

    total_millis(hours, minutes, seconds, millis)
}

/// `None` when the fields overflow, which marks the timestamp as malformed
fn total_millis(hours: u64, minutes: u64, seconds: u64, millis: u64) -> Option<Duration> {
    let total = hours
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(millis)?;
    Some(Duration::from_millis(total))
}
