use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use anki_miner_rust::anki::{AnkiConnectClient, KnownWordsFile, KnownWordsSource, SyncedKnownWords};
use anki_miner_rust::batch::BatchCoordinator;
use anki_miner_rust::config::Config;
use anki_miner_rust::cues::Offset;
use anki_miner_rust::export::write_tsv;
use anki_miner_rust::filter::KnownWords;
use anki_miner_rust::pipeline::{load_known_words, write_report, EpisodeJob, MiningPipeline, RunContext, RunMode};
use anki_miner_rust::progress::CancellationToken;
use anki_miner_rust::validation::SetupValidator;

fn cli() -> Command {
    let offset = Arg::new("offset")
        .long("offset")
        .value_name("SECS")
        .help("Subtitle offset in seconds (negative shifts earlier)")
        .allow_hyphen_values(true)
        .value_parser(clap::value_parser!(f64));
    let preview = Arg::new("preview")
        .long("preview")
        .help("Show would-be cards without extracting media or creating notes")
        .action(ArgAction::SetTrue);

    Command::new("Anki Miner (Rust)")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Mine vocabulary flashcards from subtitled video")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)")
                .global(true),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("NUM")
                .help("Number of parallel extraction workers")
                .value_parser(clap::value_parser!(usize))
                .global(true),
        )
        .arg(
            Arg::new("known-words")
                .long("known-words")
                .value_name("FILE")
                .help("Plain word list used instead of the Anki vocabulary")
                .global(true),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_name("FILE")
                .help("Write the run report as JSON")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("mine")
                .about("Mine a single episode")
                .arg(Arg::new("video").long("video").value_name("FILE").required(true))
                .arg(Arg::new("subtitle").long("subtitle").value_name("FILE").required(true))
                .arg(offset.clone())
                .arg(preview.clone())
                .arg(
                    Arg::new("export")
                        .long("export")
                        .value_name("FILE")
                        .help("Also write the cards as TSV"),
                ),
        )
        .subcommand(
            Command::new("batch")
                .about("Pair and mine every episode under a folder")
                .arg(Arg::new("root").value_name("DIR").required(true))
                .arg(offset)
                .arg(preview),
        )
        .subcommand(Command::new("check").about("Validate tools, dictionary and AnkiConnect setup"))
}

fn load_config(matches: &ArgMatches) -> (Config, Option<String>) {
    match matches.get_one::<String>("config") {
        Some(path) => match Config::from_file(Path::new(path)) {
            Ok(config) => (config.with_env_overrides(), None),
            Err(e) => (Config::from_env(), Some(format!("{:#}, using defaults", e))),
        },
        None => match Config::load() {
            Ok(config) => (config, None),
            Err(e) => (Config::from_env(), Some(format!("{}, using defaults", e))),
        },
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("anki_miner_rust={},anki_miner={},warn", level, level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn report_path(matches: &ArgMatches, config: &Config, kind: &str) -> Option<PathBuf> {
    if let Some(path) = matches.get_one::<String>("report") {
        return Some(PathBuf::from(path));
    }
    config.output.report_dir.as_ref().map(|dir| {
        dir.join(format!(
            "{}-{}.json",
            kind,
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ))
    })
}

async fn known_words(matches: &ArgMatches, config: &Config) -> Result<KnownWords> {
    let source: Arc<dyn KnownWordsSource> = match matches.get_one::<String>("known-words") {
        Some(path) => Arc::new(KnownWordsFile::new(PathBuf::from(path))),
        None => {
            let anki: Arc<dyn KnownWordsSource> = Arc::new(AnkiConnectClient::new(&config.anki)?);
            match &config.anki.known_words_store {
                Some(path) => {
                    let store = anki_miner_rust::anki::KnownWordStore::open(path.clone()).await?;
                    Arc::new(SyncedKnownWords::new(anki, Arc::new(store)))
                }
                None => anki,
            }
        }
    };

    match load_known_words(source.as_ref()).await {
        Ok(words) => Ok(words),
        Err(e) => {
            warn!("Known words unavailable, every word counts as new: {}", e);
            Ok(KnownWords::default())
        }
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️ Cancel requested, finishing in-flight work...");
            cancel.cancel();
        }
    });
}

fn apply_run_overrides(config: &mut Config, matches: &ArgMatches, sub: &ArgMatches) {
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.performance.max_parallel_workers = *workers;
    }
    if let Some(offset) = sub.get_one::<f64>("offset") {
        config.timing.subtitle_offset = *offset;
    }
}

fn run_mode(sub: &ArgMatches) -> RunMode {
    if sub.get_flag("preview") {
        RunMode::Preview
    } else {
        RunMode::Full
    }
}

async fn mine(matches: &ArgMatches, sub: &ArgMatches, mut config: Config) -> Result<()> {
    apply_run_overrides(&mut config, matches, sub);
    config.validate()?;

    let video = PathBuf::from(sub.get_one::<String>("video").context("missing --video")?);
    let subtitle = PathBuf::from(sub.get_one::<String>("subtitle").context("missing --subtitle")?);
    if !video.exists() {
        return Err(anyhow!("Video not found: {}", video.display()));
    }

    info!("🚀 Anki Miner (Rust) starting...");
    info!("{}", config.summary());

    let pipeline = MiningPipeline::from_config(&config).await?;
    pipeline.load_definition_cache().await;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    let run = RunContext::new(known_words(matches, &config).await?, run_mode(sub)).with_cancel(cancel);

    let job = EpisodeJob::new(video, subtitle, Offset::default());
    let report = pipeline.run_episode(&job, &run).await?;

    if let Err(e) = pipeline.save_definition_cache().await {
        warn!("Failed to save definition cache: {}", e);
    }

    for decision in report.decisions.iter().filter(|d| !d.keep) {
        println!(
            "{:>8.2}s  {}  ({:?})",
            decision.timestamp_secs, decision.word, decision.reason
        );
    }
    for preview in &report.previews {
        println!(
            "{:>8.2}s  {}  {}  {}",
            preview.timestamp_secs,
            preview.word,
            preview.sentence,
            preview.definition.as_deref().unwrap_or("(no definition)")
        );
    }
    for failure in &report.failures {
        warn!(
            "❌ {} at {:.2}s [{}]: {}",
            failure.word, failure.timestamp_secs, failure.kind, failure.message
        );
    }

    if let Some(path) = sub.get_one::<String>("export") {
        write_tsv(&report.cards, Path::new(path)).await?;
    }
    if let Some(path) = report_path(matches, &config, "episode") {
        write_report(&report, &path).await?;
    }

    info!("✅ Cards: {}", report.committed_cards());
    if !report.uncommitted.is_empty() {
        warn!("📭 Not created in Anki: {}", report.uncommitted.join(", "));
    }
    info!("⏭️ Duplicates: {}", report.duplicates.len());
    info!("❌ Failed units: {}", report.failures.len());

    if let Some(commit_error) = &report.commit_error {
        return Err(anyhow!("Card commit failed: {}", commit_error));
    }
    if report.cancelled {
        warn!("Run was cancelled");
    }
    Ok(())
}

async fn batch(matches: &ArgMatches, sub: &ArgMatches, mut config: Config) -> Result<()> {
    apply_run_overrides(&mut config, matches, sub);
    config.validate()?;

    let root = PathBuf::from(sub.get_one::<String>("root").context("missing ROOT")?);
    info!("🚀 Anki Miner (Rust) batch starting...");
    info!("📁 Input directory: {}", root.display());
    info!("{}", config.summary());

    let pipeline = MiningPipeline::from_config(&config).await?;
    pipeline.load_definition_cache().await;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    let run = RunContext::new(known_words(matches, &config).await?, run_mode(sub)).with_cancel(cancel);

    let mut coordinator = BatchCoordinator::new(&pipeline, config.batch.clone());
    let report = coordinator.run(&root, &run).await?;

    if let Err(e) = pipeline.save_definition_cache().await {
        warn!("Failed to save definition cache: {}", e);
    }
    if let Some(path) = report_path(matches, &config, "batch") {
        write_report(&report, &path).await?;
    }

    info!("🎉 Batch completed in {:.2}s", report.elapsed_secs);
    info!("📹 Episodes: {}", report.episodes.len());
    info!("✅ Cards: {}", report.total_cards);
    info!("⚠️ Pairing failures: {}", report.pairing_failures.len());
    if report.is_partial() {
        warn!("Some episodes did not complete; see the report for details");
    }
    Ok(())
}

async fn check(config: Config) -> Result<()> {
    let report = SetupValidator::new(&config).run().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_ready() {
        Ok(())
    } else {
        Err(anyhow!("Setup has {} issue(s)", report.issues.len()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let (config, config_warning) = load_config(&matches);

    let level = if matches.get_flag("verbose") {
        "debug".to_string()
    } else {
        config.output.log_level.clone()
    };
    init_logging(&level);

    if let Some(warning) = config_warning {
        warn!("Failed to load config: {}", warning);
    }

    let result = match matches.subcommand() {
        Some(("mine", sub)) => mine(&matches, sub, config).await,
        Some(("batch", sub)) => batch(&matches, sub, config).await,
        Some(("check", _)) => check(config).await,
        _ => Err(anyhow!("Unknown command")),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_accepts_negative_offset() {
        let matches = cli()
            .try_get_matches_from([
                "anki-miner", "mine", "--video", "ep.mkv", "--subtitle", "ep.srt", "--offset", "-2.5", "--preview",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "mine");
        assert_eq!(sub.get_one::<f64>("offset"), Some(&-2.5));
        assert_eq!(run_mode(sub), RunMode::Preview);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let matches = cli()
            .try_get_matches_from(["anki-miner", "batch", "/anime", "--workers", "3", "--verbose"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let mut config = Config::default();
        apply_run_overrides(&mut config, &matches, sub);
        assert_eq!(config.performance.max_parallel_workers, 3);
        assert!(matches.get_flag("verbose"));
    }
}
