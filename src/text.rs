//! Text helpers shared by subtitle parsing, filtering and card rendering
use once_cell::sync::Lazy;
use regex::Regex;

static ASS_OVERRIDE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^}]*\}").unwrap());
static ASS_LINE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[nNh]").unwrap());
static MARKUP_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").unwrap());

/// Remove ASS override blocks, line-break escapes and markup tags, then collapse whitespace
pub fn clean_subtitle_text(raw: &str) -> String {
    let text = ASS_OVERRIDE.replace_all(raw, "");
    let text = ASS_LINE_BREAK.replace_all(&text, " ");
    let text = MARKUP_TAG.replace_all(&text, "");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Key used for dictionary caching, dedup and known-word comparison
pub fn normalize_word(word: &str) -> String {
    word.trim().to_lowercase()
}

/// Strip markup from a field value read back from Anki
pub fn strip_html(value: &str) -> String {
    let without_tags = MARKUP_TAG.replace_all(value, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn is_katakana(ch: char) -> bool {
    matches!(ch, '\u{30A0}'..='\u{30FF}' | '\u{31F0}'..='\u{31FF}' | '\u{FF66}'..='\u{FF9F}')
}

/// One run of a natural sort key: digits compare numerically, text case-insensitively
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaturalChunk {
    Number(u64),
    Text(String),
}

/// Sort key so that "Episode 2" orders before "Episode 10"
pub fn natural_sort_key(name: &str) -> Vec<NaturalChunk> {
    DIGIT_RUN
        .find_iter(name)
        .map(|m| {
            let part = m.as_str();
            match part.parse::<u64>() {
                Ok(n) if part.chars().all(|c| c.is_ascii_digit()) => NaturalChunk::Number(n),
                _ => NaturalChunk::Text(part.to_lowercase()),
            }
        })
        .collect()
}
