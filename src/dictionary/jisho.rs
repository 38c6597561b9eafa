//! Online Jisho backend with request spacing and retry
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Definition, DefinitionSource, DictionaryBackend};
use crate::config::DictionaryConfig;
use crate::error::{MiningError, Result};

#[derive(Debug, Deserialize)]
struct JishoResponse {
    #[serde(default)]
    data: Vec<JishoEntry>,
}

#[derive(Debug, Deserialize)]
struct JishoEntry {
    #[serde(default)]
    senses: Vec<JishoSense>,
}

#[derive(Debug, Deserialize)]
struct JishoSense {
    #[serde(default)]
    english_definitions: Vec<String>,
}

/// Outcome of a single HTTP attempt
enum Attempt {
    Done(Option<Definition>),
    Transient(String),
}

pub struct JishoBackend {
    client: reqwest::Client,
    api_url: String,
    min_interval: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl JishoBackend {
    pub fn new(config: &DictionaryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MiningError::Backend(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.jisho_api_url.clone(),
            min_interval: Duration::from_millis(config.jisho_delay_ms),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_secs(1),
            last_request: Mutex::new(None),
        })
    }

    /// Override the first backoff step (doubles per attempt)
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Keep at least `min_interval` between requests across all callers
    async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn attempt(&self, word: &str) -> Result<Attempt> {
        self.wait_turn().await;

        let response = match self
            .client
            .get(&self.api_url)
            .query(&[("keyword", word)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Ok(Attempt::Transient(e.to_string()));
            }
            Err(e) => return Err(MiningError::Backend(format!("Jisho request failed: {}", e))),
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Ok(Attempt::Transient(format!("Jisho returned {}", status)));
        }
        if !status.is_success() {
            return Err(MiningError::Backend(format!("Jisho returned {}", status)));
        }

        let body: JishoResponse = response
            .json()
            .await
            .map_err(|e| MiningError::Backend(format!("invalid Jisho response: {}", e)))?;

        Ok(Attempt::Done(definition_from_response(word, body)))
    }
}

fn definition_from_response(word: &str, body: JishoResponse) -> Option<Definition> {
    let entry = body.data.into_iter().next()?;
    let glosses: Vec<String> = entry
        .senses
        .into_iter()
        .map(|s| s.english_definitions.join("; "))
        .filter(|g| !g.is_empty())
        .collect();

    if glosses.is_empty() {
        None
    } else {
        Some(Definition::new(word, glosses, DefinitionSource::Online))
    }
}

#[async_trait]
impl DictionaryBackend for JishoBackend {
    fn name(&self) -> &str {
        "Jisho"
    }

    fn source(&self) -> DefinitionSource {
        DefinitionSource::Online
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn lookup(&self, word: &str) -> Result<Option<Definition>> {
        let attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.attempt(word).await? {
                Attempt::Done(definition) => {
                    debug!("Jisho lookup for {}: {}", word, definition.is_some());
                    return Ok(definition);
                }
                Attempt::Transient(reason) => {
                    last_error = reason;
                    if attempt + 1 < attempts {
                        let delay = self.retry_base_delay * 2_u32.pow(attempt);
                        warn!(
                            "Jisho attempt {} for {} failed ({}), retrying in {:?}",
                            attempt + 1,
                            word,
                            last_error,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(MiningError::Backend(format!(
            "Jisho unavailable after {} attempts: {}",
            attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn backend(server: &MockServer, retries: u32) -> JishoBackend {
        let config = DictionaryConfig {
            jisho_api_url: server.url("/api/v1/search/words"),
            jisho_delay_ms: 0,
            max_retries: retries,
            ..DictionaryConfig::default()
        };
        JishoBackend::new(&config)
            .unwrap()
            .with_retry_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_lookup_parses_first_result() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/search/words")
                    .query_param("keyword", "走る");
                then.status(200).json_body(json!({
                    "data": [
                        {"senses": [
                            {"english_definitions": ["to run"]},
                            {"english_definitions": ["to travel", "to move"]}
                        ]},
                        {"senses": [{"english_definitions": ["ignored"]}]}
                    ]
                }));
            })
            .await;

        let definition = backend(&server, 0).lookup("走る").await.unwrap().unwrap();
        mock.assert_async().await;
        assert_eq!(definition.glosses, vec!["to run", "to travel; to move"]);
        assert_eq!(definition.source, DefinitionSource::Online);
    }

    #[tokio::test]
    async fn test_empty_result_is_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/search/words");
                then.status(200).json_body(json!({"meta": {"status": 200}, "data": []}));
            })
            .await;

        assert!(backend(&server, 0).lookup("存在しない語").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_fail() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/search/words");
                then.status(503);
            })
            .await;

        let result = backend(&server, 2).lookup("猫").await;
        assert!(matches!(result, Err(MiningError::Backend(_))));
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/search/words");
                then.status(404);
            })
            .await;

        assert!(backend(&server, 3).lookup("猫").await.is_err());
        mock.assert_hits_async(1).await;
    }
}
