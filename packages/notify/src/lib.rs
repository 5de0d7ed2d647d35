#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Reports the outcome of a run.
//!
//! A [`NotificationMessage`] is built once from the final [`RunResult`]
//! and handed to a [`Notify`] implementation. Delivery is best effort: the
//! caller logs a [`NotificationError`] and carries on.

use std::time::Duration;

use async_trait::async_trait;
use energy_usage_models::{CommoditySummary, Commodity, RunResult, RunStatus, Stage};
use serde::Serialize;

/// Timeout for a single webhook delivery.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while delivering a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The webhook answered with a non-success status.
    #[error("Webhook returned HTTP {status}")]
    Status {
        /// Response status code.
        status: u16,
    },
}

/// One failed file, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    /// Commodity of the file.
    pub commodity: Commodity,
    /// Configured file name.
    pub file_name: String,
    /// Stage that failed.
    pub stage: Stage,
    /// Error message.
    pub message: String,
}

/// Summary delivered once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    /// Short headline, e.g. `Prod SUCCESS`.
    pub subject: String,
    /// Human-readable body.
    pub body: String,
    /// Overall run status.
    pub status: RunStatus,
    /// Environment the run executed in.
    pub environment: String,
    /// Totals per commodity.
    pub commodities: Vec<CommoditySummary>,
    /// Files that did not load.
    pub failures: Vec<FailedFile>,
}

impl NotificationMessage {
    /// Builds the summary for a finished run.
    #[must_use]
    pub fn from_result(result: &RunResult) -> Self {
        let environment = title_case(&result.environment_name);
        let headline = match result.status {
            RunStatus::Success => "SUCCESS",
            RunStatus::PartialFailure => "PARTIAL FAILURE",
            RunStatus::Failure => "FAILED",
            RunStatus::SkippedDisabled => "SKIPPED",
        };
        let finished = result.finished_at.format("%Y-%m-%d %H:%M:%S");

        let mut body = match result.status {
            RunStatus::Success => format!("Process succeeded at {finished} UTC."),
            RunStatus::PartialFailure => {
                format!("Process completed with failures at {finished} UTC.")
            }
            RunStatus::Failure => format!("Process failed at {finished} UTC."),
            RunStatus::SkippedDisabled => {
                format!("Process skipped at {finished} UTC: job is disabled.")
            }
        };
        if let Some(error) = &result.error {
            body.push_str(&format!("\nError: {error}"));
        }

        let commodities = result.summaries();
        for summary in &commodities {
            body.push_str(&format!(
                "\n{}: {} file(s) loaded, {} failed, {} record(s) loaded",
                summary.commodity,
                summary.files_loaded,
                summary.files_failed,
                summary.records_loaded
            ));
        }

        let failures: Vec<FailedFile> = result
            .failures()
            .map(|outcome| {
                let (stage, message) = outcome.failure.as_ref().map_or_else(
                    || (Stage::Load, "unknown failure".to_owned()),
                    |f| (f.stage, f.message.clone()),
                );
                FailedFile {
                    commodity: outcome.file.commodity,
                    file_name: outcome.file.file_name.clone(),
                    stage,
                    message,
                }
            })
            .collect();
        for failure in &failures {
            body.push_str(&format!(
                "\nFailed {} ({}) at {}: {}",
                failure.file_name, failure.commodity, failure.stage, failure.message
            ));
        }

        Self {
            subject: format!("{environment} {headline}"),
            body,
            status: result.status,
            environment: result.environment_name.clone(),
            commodities,
            failures,
        }
    }
}

/// Upper-cases the first letter of each word and lower-cases the rest.
fn title_case(value: &str) -> String {
    value
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Delivers a run summary.
#[async_trait]
pub trait Notify: Send + Sync {
    /// Sends one summary for `result`.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError`] if delivery fails.
    async fn notify(&self, result: &RunResult) -> Result<(), NotificationError>;
}

/// Posts the summary as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Creates a notifier for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Http`] if the HTTP client cannot be
    /// built.
    pub fn new(url: &str) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl Notify for WebhookNotifier {
    async fn notify(&self, result: &RunResult) -> Result<(), NotificationError> {
        let message = NotificationMessage::from_result(result);
        let response = self.client.post(&self.url).json(&message).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Status {
                status: status.as_u16(),
            });
        }
        log::info!("Sent notification: {}", message.subject);
        Ok(())
    }
}

/// Writes the summary to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notify for LogNotifier {
    async fn notify(&self, result: &RunResult) -> Result<(), NotificationError> {
        let message = NotificationMessage::from_result(result);
        match message.status {
            RunStatus::Success | RunStatus::SkippedDisabled => {
                log::info!("{}\n{}", message.subject, message.body);
            }
            RunStatus::PartialFailure | RunStatus::Failure => {
                log::error!("{}\n{}", message.subject, message.body);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{TimeZone as _, Utc};
    use energy_usage_models::{FileFailure, FileOutcome, FileStatus, SourceFile};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;

    fn outcome(name: &str, loaded: Option<u64>) -> FileOutcome {
        let mut file = SourceFile::new(Commodity::Gas, "http://example.org/energy/", name);
        file.mark_fetched(PathBuf::from(name)).unwrap();
        let failure = if loaded.is_some() {
            file.advance(FileStatus::Parsed).unwrap();
            file.advance(FileStatus::Loaded).unwrap();
            None
        } else {
            file.mark_failed();
            Some(FileFailure {
                stage: Stage::Fetch,
                message: "HTTP 404".to_owned(),
            })
        };
        FileOutcome {
            file,
            records_inserted: loaded.unwrap_or(0),
            records_updated: 0,
            rows_rejected: 0,
            failure,
            duration: Duration::ZERO,
        }
    }

    fn partial_result() -> RunResult {
        let mut result = RunResult::completed(
            "prod",
            vec![outcome("Gas2019.csv.gz", Some(100)), outcome("Gas2020.csv.gz", None)],
            Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(),
        );
        result.finished_at = Utc.with_ymd_and_hms(2024, 5, 1, 6, 5, 0).unwrap();
        result
    }

    #[test]
    fn subject_uses_title_cased_environment() {
        let message = NotificationMessage::from_result(&partial_result());
        assert_eq!(message.subject, "Prod PARTIAL FAILURE");
        assert_eq!(message.status, RunStatus::PartialFailure);

        let skipped = RunResult::skipped("dev", Utc::now());
        assert_eq!(NotificationMessage::from_result(&skipped).subject, "Dev SKIPPED");

        let aborted = RunResult::aborted("TEST", "warehouse unavailable".to_owned(), Utc::now());
        let message = NotificationMessage::from_result(&aborted);
        assert_eq!(message.subject, "Test FAILED");
        assert!(message.body.contains("warehouse unavailable"));
    }

    #[test]
    fn body_lists_counts_and_failures() {
        let message = NotificationMessage::from_result(&partial_result());

        assert!(message.body.starts_with("Process completed with failures at 2024-05-01 06:05:00 UTC."));
        assert!(message.body.contains("gas: 1 file(s) loaded, 1 failed, 100 record(s) loaded"));
        assert_eq!(message.failures.len(), 1);
        assert_eq!(message.failures[0].file_name, "Gas2020.csv.gz");
        assert_eq!(message.failures[0].stage, Stage::Fetch);
        assert_eq!(message.commodities[0].records_loaded, 100);
    }

    #[test]
    fn success_body_matches_operator_format() {
        let mut result = RunResult::completed(
            "sbox",
            vec![outcome("Gas2019.csv.gz", Some(1))],
            Utc::now(),
        );
        result.finished_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let message = NotificationMessage::from_result(&result);
        assert_eq!(message.subject, "Sbox SUCCESS");
        assert!(message.body.starts_with("Process succeeded at 2024-01-02 03:04:05 UTC."));
    }

    /// Accepts one request, answers with `status`, and returns the body.
    async fn capture_one(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response =
                format!("HTTP/1.1 {status} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;

            let text = String::from_utf8_lossy(&buf).to_string();
            text.split_once("\r\n\r\n").map(|(_, body)| body.to_owned()).unwrap_or_default()
        });

        (format!("http://{addr}/hook"), handle)
    }

    #[tokio::test]
    async fn webhook_posts_json_summary() {
        let (url, handle) = capture_one(200).await;
        let notifier = WebhookNotifier::new(&url).unwrap();

        notifier.notify(&partial_result()).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&handle.await.unwrap()).unwrap();
        assert_eq!(body["subject"], "Prod PARTIAL FAILURE");
        assert_eq!(body["status"], "PARTIAL_FAILURE");
        assert_eq!(body["environment"], "prod");
        assert_eq!(body["commodities"][0]["commodity"], "gas");
        assert_eq!(body["failures"][0]["file_name"], "Gas2020.csv.gz");
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let (url, handle) = capture_one(500).await;
        let notifier = WebhookNotifier::new(&url).unwrap();

        let err = notifier.notify(&partial_result()).await.unwrap_err();
        assert!(matches!(err, NotificationError::Status { status: 500 }));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        LogNotifier.notify(&partial_result()).await.unwrap();
    }
}
