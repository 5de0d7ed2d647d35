#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Run coordination for the energy usage job.
//!
//! A [`Coordinator`] takes a resolved [`RunConfiguration`] and drives every
//! configured file through fetch, parse, and load on a bounded pool of
//! concurrent pipelines. Each file ends `Loaded` or `Failed` independently;
//! the run then cleans up staging copies if asked to, folds the outcomes
//! into a [`RunResult`], and notifies exactly once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use energy_usage_config::{ConfigError, RunConfiguration};
use energy_usage_models::{
    Commodity, FileFailure, FileOutcome, FileStatus, RunResult, RunState, RunStatus, SourceFile,
    Stage,
};
use energy_usage_notify::Notify;
use energy_usage_source::fetch::Fetch;
use energy_usage_source::parse::{RecordStream, RowStats};
use energy_usage_source::progress::{ProgressCallback, null_progress};
use energy_usage_source::{FetchError, ParseError, paths};
use energy_usage_warehouse::{Load, LoadCounts, LoadError};
use futures::stream::{self, StreamExt as _};
use tokio_util::sync::CancellationToken;

/// Fatal errors that stop a run before any file is attempted.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Configuration could not be resolved.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The warehouse could not be opened.
    #[error("Warehouse error: {0}")]
    Warehouse(#[from] LoadError),

    /// The HTTP client could not be built.
    #[error("Fetch setup error: {0}")]
    Fetch(#[from] FetchError),

    /// Output could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the blocking half of a file pipeline ended.
enum Drained {
    Unreadable(ParseError),
    Rejected {
        error: LoadError,
        stats: RowStats,
    },
    Loaded {
        counts: LoadCounts,
        stats: RowStats,
    },
}

/// Drives one run over every configured file.
///
/// A coordinator is single-use: it starts `NotStarted` and ends in one of
/// the terminal [`RunState`]s.
pub struct Coordinator {
    config: Arc<RunConfiguration>,
    fetcher: Arc<dyn Fetch>,
    loader: Arc<dyn Load>,
    notifier: Arc<dyn Notify>,
    progress: Arc<dyn ProgressCallback>,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("environment_name", &self.config.environment_name)
            .field("files", &self.config.file_count())
            .field("state", &self.state())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator with no progress reporting and a fresh
    /// cancellation token.
    #[must_use]
    pub fn new(
        config: Arc<RunConfiguration>,
        fetcher: Arc<dyn Fetch>,
        loader: Arc<dyn Load>,
        notifier: Arc<dyn Notify>,
    ) -> Self {
        Self {
            config,
            fetcher,
            loader,
            notifier,
            progress: null_progress(),
            cancel: CancellationToken::new(),
            state: Mutex::new(RunState::NotStarted),
        }
    }

    /// Reports file-level progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Stops starting new work once `cancel` fires. Files already loading
    /// finish their transaction.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_advance_to(next) {
            log::debug!("Run state {} -> {next}", *state);
            *state = next;
        } else {
            log::warn!("Ignoring run state change {} -> {next}", *state);
        }
    }

    /// Executes the run and returns its result. Never fails: per-file
    /// problems are recorded in the outcomes and notification errors are
    /// logged.
    pub async fn run(&self) -> RunResult {
        let started_at = Utc::now();

        if !self.config.enabled {
            self.transition(RunState::Disabled);
            return skip_disabled(&self.config, self.notifier.as_ref()).await;
        }

        let start = Instant::now();
        let files: Vec<(usize, SourceFile)> = self
            .config
            .files()
            .map(|(commodity, root_url, file_name)| SourceFile::new(commodity, root_url, file_name))
            .enumerate()
            .collect();
        let concurrency = files.len().min(self.config.max_concurrency).max(1);

        log::info!(
            "Starting {} run: {} file(s), concurrency {concurrency}",
            self.config.environment_name,
            files.len()
        );
        self.transition(RunState::Running);
        self.progress.files_planned(files.len() as u64);

        let mut indexed: Vec<(usize, FileOutcome)> = stream::iter(files)
            .map(|(index, file)| async move {
                let outcome = self.process(file).await;
                self.progress.file_finished();
                (index, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let mut outcomes: Vec<FileOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

        if self.config.delete_after_load {
            cleanup(&mut outcomes).await;
        }

        let result = RunResult::completed(&self.config.environment_name, outcomes, started_at);
        self.transition(result.status.into());

        self.progress.run_finished(format!(
            "{} record(s) loaded, status {}",
            result.total_records_loaded(),
            result.status
        ));
        log_summary(&result, start);

        deliver(self.notifier.as_ref(), &result).await;
        result
    }

    /// Runs one file through fetch, parse, and load.
    async fn process(&self, mut file: SourceFile) -> FileOutcome {
        let start = Instant::now();

        if self.cancel.is_cancelled() {
            return failed(file, Stage::Cancelled, "run cancelled before start", 0, start);
        }

        self.progress
            .file_started(format!("{} {}", file.commodity, file.file_name));
        let dest = paths::staging_path(&self.config.staging_dir, file.commodity, &file.file_name);
        let fetched = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = self.fetcher.fetch(&file, &dest) => Some(result),
        };

        let path = match fetched {
            None => return failed(file, Stage::Cancelled, "run cancelled during fetch", 0, start),
            Some(Ok(fetched)) => fetched.path,
            Some(Err(e)) => return failed(file, Stage::Fetch, &e.to_string(), 0, start),
        };
        if let Err(e) = file.mark_fetched(path.clone()) {
            return failed(file, Stage::Fetch, &e.to_string(), 0, start);
        }

        let drained = self.drain(path, file.commodity, file.file_name.clone()).await;

        match drained {
            Drained::Unreadable(e) => failed(file, Stage::Parse, &e.to_string(), 0, start),
            Drained::Rejected { error, stats } => {
                advance(&mut file, FileStatus::Parsed);
                let stage = match &error {
                    LoadError::Source(_) => Stage::Parse,
                    _ => Stage::Load,
                };
                failed(file, stage, &error.to_string(), stats.invalid, start)
            }
            Drained::Loaded { counts, stats } => {
                advance(&mut file, FileStatus::Parsed);
                advance(&mut file, FileStatus::Loaded);
                log::info!(
                    "{}: loaded {} record(s) ({} new, {} updated, {} rejected) in {:.1}s",
                    file.file_name,
                    counts.inserted + counts.updated,
                    counts.inserted,
                    counts.updated,
                    stats.invalid,
                    start.elapsed().as_secs_f64()
                );
                FileOutcome {
                    file,
                    records_inserted: counts.inserted,
                    records_updated: counts.updated,
                    rows_rejected: stats.invalid,
                    failure: None,
                    duration: start.elapsed(),
                }
            }
        }
    }

    /// Parses and loads a fetched file on the blocking pool.
    async fn drain(&self, path: PathBuf, commodity: Commodity, file_name: String) -> Drained {
        let loader = self.loader.clone();
        let threshold = self.config.row_error_threshold;

        let joined = tokio::task::spawn_blocking(move || {
            let mut records = match RecordStream::open(&path, commodity, &file_name, threshold) {
                Ok(records) => records,
                Err(e) => return Drained::Unreadable(e),
            };
            match loader.load(&mut records) {
                Ok(counts) => Drained::Loaded {
                    counts,
                    stats: records.stats(),
                },
                Err(error) => Drained::Rejected {
                    error,
                    stats: records.stats(),
                },
            }
        })
        .await;

        joined.unwrap_or_else(|e| Drained::Rejected {
            error: LoadError::Join {
                message: e.to_string(),
            },
            stats: RowStats::default(),
        })
    }
}

/// Builds the `SkippedDisabled` result and notifies. Performs no network
/// or warehouse work.
pub async fn skip_disabled(config: &RunConfiguration, notifier: &dyn Notify) -> RunResult {
    log::info!(
        "Energy usage job is disabled for {}, skipping",
        config.environment_name
    );
    let result = RunResult::skipped(&config.environment_name, Utc::now());
    deliver(notifier, &result).await;
    result
}

/// Sends the run summary, logging delivery failures instead of returning
/// them.
pub async fn deliver(notifier: &dyn Notify, result: &RunResult) {
    if let Err(e) = notifier.notify(result).await {
        log::error!("Failed to deliver {} notification: {e}", result.status);
    }
}

fn advance(file: &mut SourceFile, next: FileStatus) {
    if let Err(e) = file.advance(next) {
        log::warn!("{}: {e}", file.file_name);
    }
}

fn failed(
    mut file: SourceFile,
    stage: Stage,
    message: &str,
    rows_rejected: u64,
    start: Instant,
) -> FileOutcome {
    match stage {
        Stage::Cancelled => log::warn!("{}: {message}", file.file_name),
        Stage::Fetch | Stage::Parse | Stage::Load => {
            log::error!("{}: {stage} failed: {message}", file.file_name);
        }
    }
    file.mark_failed();
    FileOutcome {
        file,
        records_inserted: 0,
        records_updated: 0,
        rows_rejected,
        failure: Some(FileFailure {
            stage,
            message: message.to_owned(),
        }),
        duration: start.elapsed(),
    }
}

/// Removes staging copies of loaded files. Failed files are kept for
/// inspection.
async fn cleanup(outcomes: &mut [FileOutcome]) {
    for outcome in outcomes.iter_mut().filter(|o| o.is_loaded()) {
        let Some(path) = outcome.file.local_path.clone() else {
            continue;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::debug!("Removed {}", path.display());
                outcome.file.local_path = None;
            }
            Err(e) => log::warn!("Could not remove {}: {e}", path.display()),
        }
    }
}

fn log_summary(result: &RunResult, start: Instant) {
    for summary in result.summaries() {
        log::info!(
            "  {}: {} file(s) loaded, {} failed, {} record(s)",
            summary.commodity,
            summary.files_loaded,
            summary.files_failed,
            summary.records_loaded
        );
    }

    let elapsed = start.elapsed().as_secs_f64();
    match result.status {
        RunStatus::Success | RunStatus::SkippedDisabled => {
            log::info!("Run finished with {} in {elapsed:.1}s", result.status);
        }
        RunStatus::PartialFailure | RunStatus::Failure => {
            log::warn!(
                "Run finished with {} in {elapsed:.1}s: {} of {} file(s) failed",
                result.status,
                result.failures().count(),
                result.files.len()
            );
        }
    }
}
