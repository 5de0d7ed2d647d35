#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the energy usage ELT job.
//!
//! A run processes one [`SourceFile`] per configured file name. Each file
//! walks the [`FileStatus`] lifecycle independently, and the finished files
//! are folded into a single immutable [`RunResult`] whose [`RunStatus`]
//! tells operators whether nothing, something, or everything failed.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Utility commodity a data file describes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Commodity {
    /// Natural gas consumption.
    Gas,
    /// Electricity consumption.
    Electricity,
}

impl Commodity {
    /// Every commodity, in processing order.
    pub const ALL: [Self; 2] = [Self::Gas, Self::Electricity];
}

/// A single validated consumption reading.
///
/// The natural key is `(meter_id, reading_timestamp, commodity)`; loading
/// the same record twice must update rather than duplicate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Meter identifier. For postcode-level aggregate files this is the
    /// postcode.
    pub meter_id: String,
    /// When the reading applies.
    pub reading_timestamp: DateTime<Utc>,
    /// Consumed quantity (kWh). Never negative.
    pub consumption_value: Decimal,
    /// Commodity of the source file.
    pub commodity: Commodity,
    /// Name of the file the record was read from.
    pub source_file_name: String,
    /// Number of meters aggregated into this row, when the file carries it.
    pub meter_count: Option<u32>,
    /// Mean consumption per meter, when the file carries it.
    pub mean_consumption: Option<Decimal>,
    /// Median consumption per meter, when the file carries it.
    pub median_consumption: Option<Decimal>,
}

impl UsageRecord {
    /// Creates a plain meter reading with no aggregate statistics.
    #[must_use]
    pub fn reading(
        meter_id: impl Into<String>,
        reading_timestamp: DateTime<Utc>,
        consumption_value: Decimal,
        commodity: Commodity,
        source_file_name: impl Into<String>,
    ) -> Self {
        Self {
            meter_id: meter_id.into(),
            reading_timestamp,
            consumption_value,
            commodity,
            source_file_name: source_file_name.into(),
            meter_count: None,
            mean_consumption: None,
            median_consumption: None,
        }
    }
}

/// Lifecycle of a [`SourceFile`] within a run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// Not yet fetched.
    Pending,
    /// Downloaded to local staging.
    Fetched,
    /// Decompressed and header validated; rows ready to stream.
    Parsed,
    /// Committed to the warehouse.
    Loaded,
    /// A stage failed; the file's pipeline stopped.
    Failed,
}

impl FileStatus {
    /// Returns `true` for `Loaded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Loaded | Self::Failed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal step.
    ///
    /// Statuses only move one step forward, or to `Failed` from any
    /// non-terminal status.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Fetched)
                | (Self::Fetched, Self::Parsed)
                | (Self::Parsed, Self::Loaded)
                | (Self::Pending | Self::Fetched | Self::Parsed, Self::Failed)
        )
    }
}

/// Error returned when a [`SourceFile`] is asked to move backwards or skip
/// a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    /// Status the file was in.
    pub from: FileStatus,
    /// Status that was requested.
    pub to: FileStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal file status transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// One configured file name for one commodity, tracked through a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Commodity the file belongs to.
    pub commodity: Commodity,
    /// File name as listed in configuration (e.g. `Gas2020.csv.gz`).
    pub file_name: String,
    /// Root URL the file is fetched from.
    pub root_url: String,
    /// Local staging copy, set once fetched.
    pub local_path: Option<PathBuf>,
    /// Current lifecycle status.
    pub status: FileStatus,
}

impl SourceFile {
    /// Creates a `Pending` file.
    #[must_use]
    pub fn new(commodity: Commodity, root_url: &str, file_name: &str) -> Self {
        Self {
            commodity,
            file_name: file_name.to_owned(),
            root_url: root_url.to_owned(),
            local_path: None,
            status: FileStatus::Pending,
        }
    }

    /// Full download URL, inserting a `/` between root and file name when
    /// the root does not already end with one.
    #[must_use]
    pub fn url(&self) -> String {
        if self.root_url.ends_with('/') {
            format!("{}{}", self.root_url, self.file_name)
        } else {
            format!("{}/{}", self.root_url, self.file_name)
        }
    }

    /// Moves the file to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the step is not allowed by
    /// [`FileStatus::can_advance_to`].
    pub const fn advance(&mut self, next: FileStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Records the staging path and moves the file to `Fetched`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the file is not `Pending`.
    pub fn mark_fetched(&mut self, path: PathBuf) -> Result<(), TransitionError> {
        self.advance(FileStatus::Fetched)?;
        self.local_path = Some(path);
        Ok(())
    }

    /// Moves the file to `Failed` unless it already reached a terminal
    /// status.
    pub const fn mark_failed(&mut self) {
        if !self.status.is_terminal() {
            self.status = FileStatus::Failed;
        }
    }
}

/// Pipeline stage a file failed in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    /// Downloading the remote file.
    Fetch,
    /// Decompressing, decoding, or validating rows.
    Parse,
    /// Writing to the warehouse.
    Load,
    /// The run was cancelled before the file finished.
    Cancelled,
}

/// Why a file ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    /// Stage that failed.
    pub stage: Stage,
    /// Human-readable error message.
    pub message: String,
}

/// Final state of one file after its pipeline finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    /// The file, in its terminal status.
    pub file: SourceFile,
    /// Rows that were new to the warehouse.
    pub records_inserted: u64,
    /// Rows that replaced an existing natural key.
    pub records_updated: u64,
    /// Rows skipped by validation.
    pub rows_rejected: u64,
    /// Set when the file is `Failed`.
    pub failure: Option<FileFailure>,
    /// Wall-clock time spent on the file.
    pub duration: Duration,
}

impl FileOutcome {
    /// Rows written (inserted plus updated). Zero for failed files.
    #[must_use]
    pub const fn records_loaded(&self) -> u64 {
        self.records_inserted + self.records_updated
    }

    /// Returns `true` if the file reached `Loaded`.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.file.status == FileStatus::Loaded
    }
}

/// Overall outcome of a run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Every configured file was loaded.
    Success,
    /// Some files loaded, some failed.
    PartialFailure,
    /// No file loaded, or the run was aborted.
    Failure,
    /// The job is disabled for this environment.
    SkippedDisabled,
}

impl RunStatus {
    /// Folds per-file outcomes into an overall status.
    ///
    /// An enabled run with no configured files is a `Success`.
    #[must_use]
    pub fn from_outcomes(outcomes: &[FileOutcome]) -> Self {
        let loaded = outcomes.iter().filter(|o| o.is_loaded()).count();
        if loaded == outcomes.len() {
            Self::Success
        } else if loaded > 0 {
            Self::PartialFailure
        } else {
            Self::Failure
        }
    }

    /// Process exit code reported to the scheduler.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success | Self::SkippedDisabled => 0,
            Self::Failure => 1,
            Self::PartialFailure => 2,
        }
    }
}

/// Coordinator lifecycle for a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Nothing has happened yet.
    NotStarted,
    /// Files are being processed.
    Running,
    /// Every file loaded.
    Completed,
    /// At least one file failed.
    CompletedWithErrors,
    /// The job is disabled; no work was done.
    Disabled,
}

impl RunState {
    /// Returns `true` once the run can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Disabled
        )
    }

    /// Whether the coordinator may move from `self` to `next`.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Running | Self::Disabled)
                | (Self::Running, Self::Completed | Self::CompletedWithErrors)
        )
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => Self::Completed,
            RunStatus::PartialFailure | RunStatus::Failure => Self::CompletedWithErrors,
            RunStatus::SkippedDisabled => Self::Disabled,
        }
    }
}

/// Per-commodity totals for notification summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommoditySummary {
    /// Commodity summarised.
    pub commodity: Commodity,
    /// Files that reached `Loaded`.
    pub files_loaded: u64,
    /// Files that ended `Failed`.
    pub files_failed: u64,
    /// Rows written across loaded files.
    pub records_loaded: u64,
}

/// Immutable result of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Environment the run executed in.
    pub environment_name: String,
    /// Overall status.
    pub status: RunStatus,
    /// Per-file outcomes in configured order.
    pub files: Vec<FileOutcome>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the result was finalised.
    pub finished_at: DateTime<Utc>,
    /// Run-level error when the run was aborted before processing files.
    pub error: Option<String>,
}

impl RunResult {
    /// Result of a run that found the job disabled.
    #[must_use]
    pub fn skipped(environment_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            environment_name: environment_name.to_owned(),
            status: RunStatus::SkippedDisabled,
            files: Vec::new(),
            started_at,
            finished_at: Utc::now(),
            error: None,
        }
    }

    /// Result of a run whose files all reached a terminal status.
    #[must_use]
    pub fn completed(
        environment_name: &str,
        files: Vec<FileOutcome>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            environment_name: environment_name.to_owned(),
            status: RunStatus::from_outcomes(&files),
            files,
            started_at,
            finished_at: Utc::now(),
            error: None,
        }
    }

    /// Result of a run aborted by a fatal error before any file was
    /// attempted.
    #[must_use]
    pub fn aborted(environment_name: &str, error: String, started_at: DateTime<Utc>) -> Self {
        Self {
            environment_name: environment_name.to_owned(),
            status: RunStatus::Failure,
            files: Vec::new(),
            started_at,
            finished_at: Utc::now(),
            error: Some(error),
        }
    }

    /// Totals per commodity, in processing order. Commodities without any
    /// configured file are omitted.
    #[must_use]
    pub fn summaries(&self) -> Vec<CommoditySummary> {
        Commodity::ALL
            .iter()
            .filter_map(|&commodity| {
                let files: Vec<&FileOutcome> = self
                    .files
                    .iter()
                    .filter(|o| o.file.commodity == commodity)
                    .collect();
                if files.is_empty() {
                    return None;
                }
                let files_loaded = files.iter().filter(|o| o.is_loaded()).count() as u64;
                Some(CommoditySummary {
                    commodity,
                    files_loaded,
                    files_failed: files.len() as u64 - files_loaded,
                    records_loaded: files.iter().map(|o| o.records_loaded()).sum(),
                })
            })
            .collect()
    }

    /// Rows written across every loaded file.
    #[must_use]
    pub fn total_records_loaded(&self) -> u64 {
        self.files.iter().map(FileOutcome::records_loaded).sum()
    }

    /// Outcomes of files that failed.
    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|o| !o.is_loaded())
    }
}
