use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::anki::AnkiConnectClient;
use crate::config::Config;
use crate::tokenizer::{MecabTokenizer, Tokenizer};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub component: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ffmpeg_ok: bool,
    pub ffprobe_ok: bool,
    pub tokenizer_ok: bool,
    pub ankiconnect_ok: bool,
    pub deck_exists: bool,
    pub note_type_exists: bool,
    pub offline_dictionary_ok: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// No blocking problems; warnings are allowed
    pub fn is_ready(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    fn issue(&mut self, component: &str, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", component, message);
        self.issues.push(ValidationIssue {
            component: component.to_string(),
            severity,
            message,
        });
    }
}

/// Checks that external tools and services are reachable before mining
pub struct SetupValidator<'a> {
    config: &'a Config,
}

impl<'a> SetupValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    async fn command_runs(program: &str, arg: &str) -> bool {
        let run = Command::new(program)
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        matches!(tokio::time::timeout(CHECK_TIMEOUT, run).await, Ok(Ok(status)) if status.success())
    }

    /// Never fails; every problem becomes an issue in the report
    pub async fn run(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        info!("🔍 Validating setup...");

        report.ffmpeg_ok = Self::command_runs(&self.config.media.ffmpeg_path, "-version").await;
        if !report.ffmpeg_ok {
            report.issue(
                "ffmpeg",
                Severity::Error,
                format!("'{}' is not runnable", self.config.media.ffmpeg_path),
            );
        }

        report.ffprobe_ok = Self::command_runs(&self.config.media.ffprobe_path, "-version").await;
        if !report.ffprobe_ok {
            report.issue(
                "ffprobe",
                Severity::Error,
                format!("'{}' is not runnable", self.config.media.ffprobe_path),
            );
        }

        let tokenizer = MecabTokenizer::new(self.config.tokenizer.clone());
        match tokio::time::timeout(CHECK_TIMEOUT, tokenizer.tokenize("猫")).await {
            Ok(Ok(tokens)) if !tokens.is_empty() => report.tokenizer_ok = true,
            Ok(Ok(_)) => report.issue("tokenizer", Severity::Error, "tokenizer returned no tokens"),
            Ok(Err(e)) => report.issue("tokenizer", Severity::Error, e.to_string()),
            Err(_) => report.issue("tokenizer", Severity::Error, "tokenizer timed out"),
        }

        self.check_anki(&mut report).await;

        let dictionary = &self.config.dictionary;
        report.offline_dictionary_ok = dictionary.use_offline && dictionary.jmdict_path.is_file();
        if dictionary.use_offline && !report.offline_dictionary_ok {
            let severity = if dictionary.use_online {
                Severity::Warning
            } else {
                Severity::Error
            };
            report.issue(
                "dictionary",
                severity,
                format!("JMdict not found at {}", dictionary.jmdict_path.display()),
            );
        }

        info!(
            "{} Setup check finished with {} issue(s)",
            if report.is_ready() { "✅" } else { "❌" },
            report.issues.len()
        );
        report
    }

    async fn check_anki(&self, report: &mut ValidationReport) {
        let anki = &self.config.anki;
        let client = match AnkiConnectClient::new(anki) {
            Ok(client) => client,
            Err(e) => {
                report.issue("ankiconnect", Severity::Error, e.to_string());
                return;
            }
        };

        match client.version().await {
            Ok(version) => {
                report.ankiconnect_ok = true;
                info!("🔌 AnkiConnect version {}", version);
            }
            Err(e) => {
                report.issue("ankiconnect", Severity::Error, e.to_string());
                return;
            }
        }

        match client.deck_names().await {
            Ok(decks) => {
                report.deck_exists = decks.iter().any(|d| d == &anki.deck_name);
                if !report.deck_exists {
                    report.issue("deck", Severity::Error, format!("deck '{}' does not exist", anki.deck_name));
                }
            }
            Err(e) => report.issue("deck", Severity::Error, e.to_string()),
        }

        match client.model_names().await {
            Ok(models) => {
                report.note_type_exists = models.iter().any(|m| m == &anki.note_type);
                if !report.note_type_exists {
                    report.issue(
                        "note_type",
                        Severity::Error,
                        format!("note type '{}' does not exist", anki.note_type),
                    );
                }
            }
            Err(e) => report.issue("note_type", Severity::Error, e.to_string()),
        }
    }
}
