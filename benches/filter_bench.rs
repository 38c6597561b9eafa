use anki_miner_rust::batch::{pair_files, DiscoveredFiles};
use anki_miner_rust::config::{BatchConfig, FilterConfig};
use anki_miner_rust::cues::{CueMatcher, Offset};
use anki_miner_rust::error::Result;
use anki_miner_rust::filter::{KnownWords, WordFilter};
use anki_miner_rust::subtitle::{Cue, SubtitleFormat, SubtitleParser};
use anki_miner_rust::tokenizer::{PartOfSpeech, Token, Tokenizer};
use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Fixed token stream so the benchmark measures matching, not MeCab
struct SplitTokenizer;

#[async_trait]
impl Tokenizer for SplitTokenizer {
    async fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        Ok(text
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| {
                let pos = if i % 3 == 1 {
                    PartOfSpeech::Particle
                } else {
                    PartOfSpeech::Noun
                };
                Token::new(word, word, pos)
            })
            .collect())
    }
}

fn episode_cues(count: usize) -> Vec<Cue> {
    (0..count)
        .map(|i| {
            Cue::new(
                format!("単語{} が 名詞{} です", i % 400, i % 250),
                Duration::from_millis(i as u64 * 2_500),
                Duration::from_millis(i as u64 * 2_500 + 2_000),
                "episode.srt",
            )
        })
        .collect()
}

/// Benchmark cue matching plus filtering for a full-length episode
fn bench_match_and_filter(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cues = episode_cues(600);
    let matcher = CueMatcher::new(Arc::new(SplitTokenizer), Offset::from_secs_f64(-1.5), Offset::default());
    let known = KnownWords::new((0..5_000).map(|i| format!("単語{}", i * 2)));
    let filter = WordFilter::new(&FilterConfig::default(), known);

    c.bench_function("match_cues_600", |b| {
        b.iter(|| rt.block_on(async { matcher.match_cues(black_box(&cues)).await.unwrap() }))
    });

    let units = rt.block_on(matcher.match_cues(&cues)).unwrap();
    c.bench_function("classify_all_2400_units", |b| {
        b.iter(|| filter.classify_all(black_box(units.clone())))
    });
}

/// Benchmark SRT parsing
fn bench_subtitle_parsing(c: &mut Criterion) {
    let mut srt = String::new();
    for i in 0..1_000u64 {
        let start = i * 2_500;
        srt.push_str(&format!(
            "{}\n00:{:02}:{:02},{:03} --> 00:{:02}:{:02},{:03}\n<i>台詞{}</i>\n\n",
            i + 1,
            (start / 60_000) % 60,
            (start / 1000) % 60,
            start % 1000,
            ((start + 2_000) / 60_000) % 60,
            ((start + 2_000) / 1000) % 60,
            (start + 2_000) % 1000,
            i
        ));
    }
    let path = PathBuf::from("episode.srt");

    c.bench_function("parse_srt_1000_cues", |b| {
        b.iter(|| SubtitleParser::parse_str(black_box(&srt), SubtitleFormat::Srt, &path).unwrap())
    });
}

/// Benchmark pairing for a season-sized folder
fn bench_pairing(c: &mut Criterion) {
    let files = DiscoveredFiles {
        videos: (1..=200)
            .map(|i| PathBuf::from(format!("/anime/Show/Show - {:02}.mkv", i)))
            .collect(),
        subtitles: (1..=200)
            .map(|i| PathBuf::from(format!("/anime/Show/Show.E{:02}.srt", i)))
            .collect(),
    };
    let config = BatchConfig::default();

    c.bench_function("pair_200_episodes", |b| {
        b.iter(|| pair_files(black_box(&files), &config))
    });
}

criterion_group!(benches, bench_match_and_filter, bench_subtitle_parsing, bench_pairing);
criterion_main!(benches);
