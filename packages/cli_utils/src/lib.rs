#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for the energy usage job.
//!
//! Provides an `indicatif`-backed progress bar behind the
//! [`ProgressCallback`] trait, plus [`init_logger`] which sets up
//! `indicatif-log-bridge` so that `log::info!` and friends are suspended
//! while progress bars redraw.

use std::io::Write as _;
use std::sync::Arc;

use energy_usage_source::progress::ProgressCallback;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// How log lines are rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// Coloured, human-readable lines for terminals.
    Pretty,
    /// One JSON object per line for log collectors, tagged with `log_name`.
    Json {
        /// Value of the `logName` field, usually the service name.
        log_name: String,
    },
}

/// An `indicatif` [`ProgressBar`] that implements [`ProgressCallback`].
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    /// Creates a bar counting finished files. The length arrives through
    /// [`ProgressCallback::files_planned`].
    #[must_use]
    pub fn files_bar(multi: &MultiProgress, message: &str) -> Arc<dyn ProgressCallback> {
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix} {wide_bar:.green/dim} {pos}/{len} files [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        bar.set_prefix(message.to_string());

        Arc::new(Self { bar })
    }
}

impl ProgressCallback for IndicatifProgress {
    fn files_planned(&self, files: u64) {
        self.bar.set_length(files);
        self.bar.set_position(0);
    }

    fn file_started(&self, label: String) {
        self.bar.set_message(label);
    }

    fn file_finished(&self) {
        self.bar.inc(1);
    }

    fn run_finished(&self, summary: String) {
        self.bar.finish_with_message(summary);
    }
}

/// Renders one log record as a JSON object.
#[must_use]
pub fn json_line(
    log_name: &str,
    level: log::Level,
    target: &str,
    message: &str,
    at: chrono::DateTime<chrono::Utc>,
) -> String {
    serde_json::json!({
        "logName": log_name,
        "level": level.as_str(),
        "atUtc": at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "target": target,
        "event": message,
    })
    .to_string()
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// The level comes from `RUST_LOG`, defaulting to `info`.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger(format: &LogFormat) -> MultiProgress {
    let multi = MultiProgress::new();

    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(spec) => {
            builder.parse_filters(&spec);
        }
        Err(_) => {
            builder.filter_level(log::LevelFilter::Info);
        }
    }

    if let LogFormat::Json { log_name } = format {
        let log_name = log_name.clone();
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "{}",
                json_line(
                    &log_name,
                    record.level(),
                    record.target(),
                    &record.args().to_string(),
                    chrono::Utc::now(),
                )
            )
        });
    }

    let logger = builder.build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // Ignore error if logger was already set (e.g., in tests)

    log::set_max_level(level);

    multi
}
