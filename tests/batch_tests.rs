mod common;

use std::path::Path;

use anki_miner_rust::assembler::DuplicateScope;
use anki_miner_rust::batch::{BatchCoordinator, BatchState};
use anki_miner_rust::config::{BatchConfig, ConfigBuilder};
use anki_miner_rust::error::FailureKind;
use anki_miner_rust::filter::KnownWords;
use anki_miner_rust::pipeline::{RunContext, RunMode};

use common::{harness, CountingMediaTool, Fixture, RecordingCardService};

fn run() -> RunContext {
    RunContext::new(KnownWords::default(), RunMode::Full)
}

#[tokio::test]
async fn test_word_mined_once_across_episodes() {
    let fx = Fixture::new();
    let config = fx.config();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/Frieren - 01.mkv");
    fx.srt("anime/Frieren - 01.srt", &[(1_000, 2_000, "走る/verb 犬")]);
    fx.video("anime/Frieren - 02.mkv");
    fx.srt("anime/Frieren - 02.srt", &[(3_000, 4_000, "走る/verb 空")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    assert_eq!(report.series, vec!["Frieren"]);
    assert_eq!(report.episodes.len(), 2);
    assert_eq!(report.total_cards, 3);
    assert!(!report.is_partial());
    assert_eq!(coordinator.state(), &BatchState::Completed { partial: false });

    let first = report.episodes[0].report.as_ref().unwrap();
    let second = report.episodes[1].report.as_ref().unwrap();
    assert!(report.episodes[0].video.ends_with("Frieren - 01.mkv"));
    assert_eq!(first.cards.len(), 2);
    assert_eq!(second.cards.len(), 1);
    assert_eq!(second.cards[0].word, "空");
    assert_eq!(second.duplicates.len(), 1);
    assert_eq!(second.duplicates[0].word, "走る");
    assert_eq!(second.duplicates[0].scope, DuplicateScope::PriorEpisode);

    assert_eq!(h.service.words(), vec!["走る", "犬", "空"]);
}

#[tokio::test]
async fn test_word_that_failed_earlier_is_mined_in_later_episode() {
    let fx = Fixture::new();
    let config = fx.config();
    let tool = CountingMediaTool::new();
    // Screenshot of episode 1's cue: 1s start plus the 1s screenshot offset
    tool.fail_at_ms.lock().unwrap().insert(2_000);
    let h = harness(&config, tool, RecordingCardService::default());

    fx.video("anime/Frieren - 01.mkv");
    fx.srt("anime/Frieren - 01.srt", &[(1_000, 2_000, "走る/verb")]);
    fx.video("anime/Frieren - 02.mkv");
    fx.srt("anime/Frieren - 02.srt", &[(3_000, 4_000, "走る/verb")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    let first = report.episodes[0].report.as_ref().unwrap();
    let second = report.episodes[1].report.as_ref().unwrap();
    assert!(first.cards.is_empty());
    assert_eq!(first.failures[0].word, "走る");
    assert_eq!(first.failures[0].kind, FailureKind::ExtractionError);

    assert_eq!(second.cards.len(), 1);
    assert_eq!(second.cards[0].word, "走る");
    assert!(second.duplicates.is_empty());
    assert_eq!(h.service.words(), vec!["走る"]);
    assert_eq!(report.total_cards, 1);
}

#[tokio::test]
async fn test_min_episode_appearances_keeps_recurring_words() {
    let fx = Fixture::new();
    let config = ConfigBuilder::new()
        .with_media_dir(fx.media_dir())
        .with_min_word_length(1)
        .with_min_episode_appearances(2)
        .without_dictionary_cache()
        .build();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/Show - 01.mkv");
    fx.srt("anime/Show - 01.srt", &[(1_000, 2_000, "走る/verb 犬")]);
    fx.video("anime/Show - 02.mkv");
    fx.srt("anime/Show - 02.srt", &[(3_000, 4_000, "走る/verb 空")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    let first = report.episodes[0].report.as_ref().unwrap();
    let second = report.episodes[1].report.as_ref().unwrap();
    assert_eq!(first.filter.few_episodes, 1);
    assert_eq!(second.filter.few_episodes, 1);
    assert_eq!(second.duplicates[0].word, "走る");
    assert_eq!(h.service.words(), vec!["走る"]);
    assert_eq!(report.total_cards, 1);
}

#[tokio::test]
async fn test_pairing_failures_do_not_stop_batch() {
    let fx = Fixture::new();
    let config = fx.config();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/Show - 01.mkv");
    fx.srt("anime/Show - 01.srt", &[(1_000, 2_000, "犬")]);
    fx.video("anime/Show - 02.mkv");
    fx.srt("anime/Extras.srt", &[(1_000, 2_000, "空")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    assert_eq!(report.episodes.len(), 1);
    assert_eq!(report.total_cards, 1);
    assert_eq!(report.pairing_failures.len(), 2);
    assert!(report
        .pairing_failures
        .iter()
        .all(|f| f.kind == FailureKind::PairingError));
    let failed: Vec<&Path> = report.pairing_failures.iter().map(|f| f.path.as_path()).collect();
    assert!(failed.iter().any(|p| p.ends_with("Show - 02.mkv")));
    assert!(failed.iter().any(|p| p.ends_with("Extras.srt")));
}

#[tokio::test]
async fn test_episode_number_fallback_pairs_renamed_subtitles() {
    let fx = Fixture::new();
    let config = fx.config();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/[Group] Mushishi - 03 [1080p].mkv");
    fx.srt("anime/Mushishi.E03.ja.srt", &[(1_000, 2_000, "海")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    assert!(report.pairing_failures.is_empty());
    assert_eq!(report.episodes.len(), 1);
    assert_eq!(report.total_cards, 1);
}

#[tokio::test]
async fn test_unparseable_episode_marks_batch_partial() {
    let fx = Fixture::new();
    let config = fx.config();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/Show - 01.mkv");
    std::fs::write(fx.path().join("anime/Show - 01.srt"), "garbage").unwrap();
    fx.video("anime/Show - 02.mkv");
    fx.srt("anime/Show - 02.srt", &[(1_000, 2_000, "犬")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    assert_eq!(report.episodes.len(), 2);
    assert!(report.is_partial());
    let broken = &report.episodes[0];
    assert!(broken.report.is_none());
    assert_eq!(broken.error.as_ref().unwrap().kind, FailureKind::ParseError);
    assert_eq!(report.episodes[1].report.as_ref().unwrap().cards.len(), 1);
    assert_eq!(report.total_cards, 1);
}

#[tokio::test]
async fn test_series_offset_applies_to_every_episode() {
    let fx = Fixture::new();
    let config = ConfigBuilder::new()
        .with_media_dir(fx.media_dir())
        .with_min_word_length(1)
        .with_series_offset("frieren", -2.5)
        .without_dictionary_cache()
        .build();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/Frieren - 01.mkv");
    fx.srt("anime/Frieren - 01.srt", &[(10_000, 12_000, "猫")]);
    fx.video("anime/Other - 01.mkv");
    fx.srt("anime/Other - 01.srt", &[(10_000, 12_000, "犬")]);

    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run()).await.unwrap();

    assert_eq!(report.series, vec!["Frieren", "Other"]);
    let frieren = report.episodes[0].report.as_ref().unwrap();
    let other = report.episodes[1].report.as_ref().unwrap();
    assert!((frieren.offset_secs + 2.5).abs() < 1e-9);
    assert!((frieren.cards[0].timestamp_secs - 7.5).abs() < 1e-9);
    assert!((other.cards[0].timestamp_secs - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_missing_root_is_an_error() {
    let fx = Fixture::new();
    let config = fx.config();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    let mut coordinator = BatchCoordinator::new(&h.pipeline, BatchConfig::default());
    assert!(coordinator.run(&fx.path().join("nowhere"), &run()).await.is_err());
}

#[tokio::test]
async fn test_cancelled_batch_stops_before_next_episode() {
    let fx = Fixture::new();
    let config = fx.config();
    let h = harness(&config, CountingMediaTool::new(), RecordingCardService::default());

    fx.video("anime/Show - 01.mkv");
    fx.srt("anime/Show - 01.srt", &[(1_000, 2_000, "犬")]);

    let run = run();
    run.cancel.cancel();
    let mut coordinator = BatchCoordinator::new(&h.pipeline, config.batch.clone());
    let report = coordinator.run(&fx.path().join("anime"), &run).await.unwrap();

    assert!(report.cancelled);
    assert!(report.episodes.is_empty());
    assert!(report.is_partial());
    assert_eq!(h.service.calls(), 0);
}
