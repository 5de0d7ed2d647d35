#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Getting energy usage files from the remote source into typed records.
//!
//! [`fetch`] downloads one gzip CSV per [`SourceFile`] into local staging,
//! retrying transient failures. [`parse`] streams the staged file back out
//! as validated [`UsageRecord`]s, counting and skipping malformed rows.
//!
//! [`SourceFile`]: energy_usage_models::SourceFile
//! [`UsageRecord`]: energy_usage_models::UsageRecord

pub mod fetch;
pub mod parse;
pub mod paths;
pub mod progress;
pub mod retry;

/// Errors that can occur while downloading a source file.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP request or body transfer failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    Status {
        /// Response status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// Writing the staging file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL could not be built or parsed.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
    },
}

impl FetchError {
    /// Returns `true` if another attempt might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => retry::is_transient(e),
            Self::Status { status, .. } => retry::is_transient_status(*status),
            Self::Io(_) | Self::InvalidUrl { .. } => false,
        }
    }

    /// Returns `true` for an HTTP 404 response.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Errors that fail a whole file during decoding.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Reading or decompressing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The CSV structure could not be read.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The header row matches no known layout.
    #[error("Unrecognised header row: {headers}")]
    UnknownLayout {
        /// Header row as read.
        headers: String,
    },

    /// A postcode annual file whose name carries no year.
    #[error("Cannot determine the year from file name {file_name:?}")]
    MissingYear {
        /// Offending file name.
        file_name: String,
    },

    /// Too many rows were rejected for the file to be trusted.
    #[error("{invalid} of {total} rows invalid, above threshold {threshold}")]
    TooManyInvalidRows {
        /// Rejected rows.
        invalid: u64,
        /// All data rows read.
        total: u64,
        /// Configured maximum fraction.
        threshold: f64,
    },
}

/// A single rejected row. The file continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct RowError {
    /// 1-based line number in the decompressed CSV.
    pub line: u64,
    /// Why the row was rejected.
    pub reason: String,
}
