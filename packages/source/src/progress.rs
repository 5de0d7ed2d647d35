//! File-level progress events emitted during a run.
//!
//! The coordinator announces how many files it will process, then reports
//! each file as it starts and as it reaches `Loaded` or `Failed`. The
//! binary renders these with an `indicatif` bar; tests and library callers
//! use [`NullProgress`].

use std::sync::Arc;

/// Observer for run progress. Called from concurrent file pipelines.
pub trait ProgressCallback: Send + Sync {
    /// The run will process `files` files.
    fn files_planned(&self, files: u64);

    /// A file pipeline started; `label` names the commodity and file.
    fn file_started(&self, label: String);

    /// A file reached a terminal status.
    fn file_finished(&self);

    /// Every file is terminal. `summary` is a one-line outcome.
    fn run_finished(&self, summary: String);
}

/// Discards every event.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn files_planned(&self, _files: u64) {}
    fn file_started(&self, _label: String) {}
    fn file_finished(&self) {}
    fn run_finished(&self, _summary: String) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
