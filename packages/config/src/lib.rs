#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Run configuration for the energy usage job.
//!
//! [`resolve`] turns named string parameters (see [`parameters`]) into an
//! immutable [`RunConfiguration`]. It performs no I/O besides reading
//! parameters, and it fails before any network or warehouse work when a
//! required value is missing or malformed.

pub mod environment;
pub mod parameters;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use energy_usage_models::Commodity;
use serde::Serialize;

use crate::parameters::{ParameterName, ParameterSource};

/// Service name used when `CRUK_SERVICE_NAME` is not set.
pub const DEFAULT_SERVICE_NAME: &str = "bi-energy-usage";

/// Warehouse schema used when `CRUK_WAREHOUSE_SCHEMA` is not set.
pub const DEFAULT_SCHEMA: &str = "energy";

/// Staging directory used when `CRUK_WORKING_DIRECTORY` is not set.
pub const DEFAULT_WORKING_DIRECTORY: &str = "data";

/// Default number of files processed at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default fraction of malformed rows tolerated per file.
pub const DEFAULT_ROW_ERROR_THRESHOLD: f64 = 0.05;

/// Default number of fetch attempts per file.
pub const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_FETCH_BACKOFF_MS: u64 = 2_000;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;

const MAX_CONCURRENCY_LIMIT: usize = 64;
const MAX_FETCH_ATTEMPTS_LIMIT: u32 = 10;

/// Errors raised while resolving configuration. All of them are fatal for
/// the run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required parameter is not set.
    #[error("Missing required parameter {name}")]
    Missing {
        /// Parameter name as the operator sets it.
        name: String,
    },

    /// A parameter is set but its value is not acceptable.
    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The parameter file could not be read.
    #[error("Failed to read parameter file {path}: {source}")]
    File {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The parameter file is not valid TOML.
    #[error("Invalid parameter file: {0}")]
    Toml(#[from] toml::de::Error),

    /// The parameter file has no table for the requested environment.
    #[error("Unknown environment {name:?} (available: {available})")]
    UnknownEnvironment {
        /// Requested environment.
        name: String,
        /// Comma-separated environments defined in the file.
        available: String,
    },

    /// The parameter file names a parameter the job does not know.
    #[error("Unknown parameter {name:?} in parameter file")]
    UnknownParameter {
        /// Offending key.
        name: String,
    },
}

impl ConfigError {
    fn invalid(name: ParameterName, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.env_key(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Where one commodity's files come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommoditySource {
    /// HTTP(S) root the file names are appended to.
    pub root_url: String,
    /// File names in processing order.
    pub file_names: Vec<String>,
}

/// Location of the warehouse database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarehouseIdentity {
    /// Path of the `DuckDB` database file.
    pub database: PathBuf,
    /// Schema holding the usage table.
    pub schema: String,
}

/// Retry and timeout settings for file downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchSettings {
    /// Total attempts per file, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub backoff_base: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_FETCH_BACKOFF_MS),
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

/// Fully resolved, immutable parameters for a single run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfiguration {
    /// Whether the job should do anything at all.
    pub enabled: bool,
    /// Service name reported in logs and notifications.
    pub service_name: String,
    /// Environment the run executes in (`dev`, `prod`, ...).
    pub environment_name: String,
    /// Sources per commodity. Empty when disabled.
    pub commodity_sources: BTreeMap<Commodity, CommoditySource>,
    /// Delete staging copies of loaded files after the run.
    pub delete_after_load: bool,
    /// Warehouse location.
    pub warehouse: WarehouseIdentity,
    /// Root directory for downloaded files.
    pub staging_dir: PathBuf,
    /// Maximum number of files processed at once.
    pub max_concurrency: usize,
    /// Fraction of malformed rows above which a file fails.
    pub row_error_threshold: f64,
    /// Download retry settings.
    pub fetch: FetchSettings,
    /// Webhook that receives the run summary, if any.
    pub notification_url: Option<String>,
}

impl RunConfiguration {
    /// Every `(commodity, root_url, file_name)` in processing order: gas
    /// first, then electricity, each in configured order.
    pub fn files(&self) -> impl Iterator<Item = (Commodity, &str, &str)> {
        Commodity::ALL.into_iter().flat_map(move |commodity| {
            self.commodity_sources
                .get(&commodity)
                .into_iter()
                .flat_map(move |source| {
                    source
                        .file_names
                        .iter()
                        .map(move |name| (commodity, source.root_url.as_str(), name.as_str()))
                })
        })
    }

    /// Number of configured files across all commodities.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.commodity_sources
            .values()
            .map(|source| source.file_names.len())
            .sum()
    }

    /// Copy safe to print: the notification URL is masked since webhook
    /// URLs usually embed a token.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.notification_url.is_some() {
            copy.notification_url = Some("********".to_owned());
        }
        copy
    }
}

/// Splits a pipe-delimited file list, trimming segments and dropping empty
/// ones. Order is preserved.
#[must_use]
pub fn parse_file_list(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Interprets the enable flag. Only an exact `Y` enables the job.
#[must_use]
pub fn parse_enabled(value: Option<&str>) -> bool {
    match value {
        Some("Y") => true,
        None | Some("N") => false,
        Some(other) => {
            log::warn!(
                "Unrecognised value {other:?} for {}, treating the job as disabled",
                ParameterName::Enabled.env_key()
            );
            false
        }
    }
}

/// Interprets a strict `Y`/`N` flag (case-insensitive). Absent means `false`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for any other value.
pub fn parse_yes_no(name: ParameterName, value: Option<&str>) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(false);
    };
    match raw.trim().to_ascii_uppercase().as_str() {
        "Y" => Ok(true),
        "N" => Ok(false),
        _ => Err(ConfigError::invalid(name, raw, "expected Y or N")),
    }
}

/// Resolves the configuration for `environment_name`.
///
/// Only the enable flag, service name, and tunables are read when the job
/// is disabled, so a disabled environment does not need its data sources
/// configured.
///
/// # Errors
///
/// Returns [`ConfigError`] if a required parameter is missing or any value
/// is out of range.
pub fn resolve(
    environment_name: &str,
    params: &dyn ParameterSource,
) -> Result<RunConfiguration, ConfigError> {
    let get = |name: ParameterName| {
        params
            .get(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    };

    let enabled = parse_enabled(params.get(ParameterName::Enabled).as_deref());
    let service_name =
        get(ParameterName::ServiceName).unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_owned());
    let staging_dir = PathBuf::from(
        get(ParameterName::WorkingDirectory)
            .unwrap_or_else(|| DEFAULT_WORKING_DIRECTORY.to_owned()),
    );

    let max_concurrency = parse_in_range(
        ParameterName::MaxConcurrency,
        get(ParameterName::MaxConcurrency).as_deref(),
        DEFAULT_MAX_CONCURRENCY,
        1..=MAX_CONCURRENCY_LIMIT,
    )?;
    let row_error_threshold = parse_threshold(get(ParameterName::RowErrorThreshold).as_deref())?;
    let fetch = FetchSettings {
        max_attempts: parse_in_range(
            ParameterName::FetchMaxAttempts,
            get(ParameterName::FetchMaxAttempts).as_deref(),
            DEFAULT_FETCH_MAX_ATTEMPTS,
            1..=MAX_FETCH_ATTEMPTS_LIMIT,
        )?,
        backoff_base: Duration::from_millis(parse_in_range(
            ParameterName::FetchBackoffMs,
            get(ParameterName::FetchBackoffMs).as_deref(),
            DEFAULT_FETCH_BACKOFF_MS,
            0..=600_000,
        )?),
        timeout: Duration::from_secs(parse_in_range(
            ParameterName::FetchTimeoutSecs,
            get(ParameterName::FetchTimeoutSecs).as_deref(),
            DEFAULT_FETCH_TIMEOUT_SECS,
            1..=86_400,
        )?),
    };

    let schema = get(ParameterName::WarehouseSchema).unwrap_or_else(|| DEFAULT_SCHEMA.to_owned());
    if !is_identifier(&schema) {
        return Err(ConfigError::invalid(
            ParameterName::WarehouseSchema,
            &schema,
            "must be a plain SQL identifier",
        ));
    }

    let notification_url = get(ParameterName::SecretNotificationUrl)
        .map(|url| validate_url(ParameterName::SecretNotificationUrl, url))
        .transpose()?;

    let mut commodity_sources = BTreeMap::new();
    let mut delete_after_load = false;
    let database;

    if enabled {
        for commodity in Commodity::ALL {
            let root_name = ParameterName::root_url(commodity);
            let list_name = ParameterName::file_names(commodity);
            let root_url = validate_url(root_name, require(root_name, get(root_name))?)?;
            let file_names = parse_file_list(&require(list_name, get(list_name))?);
            for name in &file_names {
                validate_file_name(list_name, name)?;
            }
            commodity_sources.insert(
                commodity,
                CommoditySource {
                    root_url,
                    file_names,
                },
            );
        }
        delete_after_load = parse_yes_no(
            ParameterName::DeleteDataFiles,
            get(ParameterName::DeleteDataFiles).as_deref(),
        )?;
        database = PathBuf::from(require(
            ParameterName::WarehouseDatabase,
            get(ParameterName::WarehouseDatabase),
        )?);
    } else {
        database = get(ParameterName::WarehouseDatabase)
            .map_or_else(|| staging_dir.join("warehouse.duckdb"), PathBuf::from);
    }

    Ok(RunConfiguration {
        enabled,
        service_name,
        environment_name: environment_name.to_owned(),
        commodity_sources,
        delete_after_load,
        warehouse: WarehouseIdentity { database, schema },
        staging_dir,
        max_concurrency,
        row_error_threshold,
        fetch,
        notification_url,
    })
}

fn require(name: ParameterName, value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::Missing {
        name: name.env_key(),
    })
}

fn parse_in_range<T>(
    name: ParameterName,
    value: Option<&str>,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let Some(raw) = value else {
        return Ok(default);
    };
    let parsed: T = raw
        .parse()
        .map_err(|_| ConfigError::invalid(name, raw, "not a whole number"))?;
    if !range.contains(&parsed) {
        return Err(ConfigError::invalid(
            name,
            raw,
            format!("must be between {} and {}", range.start(), range.end()),
        ));
    }
    Ok(parsed)
}

fn parse_threshold(value: Option<&str>) -> Result<f64, ConfigError> {
    let name = ParameterName::RowErrorThreshold;
    let Some(raw) = value else {
        return Ok(DEFAULT_ROW_ERROR_THRESHOLD);
    };
    let parsed: f64 = raw
        .parse()
        .map_err(|_| ConfigError::invalid(name, raw, "not a number"))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(ConfigError::invalid(name, raw, "must be between 0 and 1"));
    }
    Ok(parsed)
}

fn validate_url(name: ParameterName, url: String) -> Result<String, ConfigError> {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(url),
        _ => Err(ConfigError::invalid(
            name,
            &url,
            "must be an http:// or https:// URL with a host",
        )),
    }
}

fn validate_file_name(name: ParameterName, file_name: &str) -> Result<(), ConfigError> {
    if file_name == "." || file_name == ".." || file_name.contains(['/', '\\']) {
        return Err(ConfigError::invalid(
            name,
            file_name,
            "file names must not contain path separators",
        ));
    }
    Ok(())
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::MapParameters;

    fn enabled_params() -> MapParameters {
        MapParameters::new()
            .with(ParameterName::Enabled, "Y")
            .with(ParameterName::DataSourceGasRootUrl, "http://example.org/energy/")
            .with(
                ParameterName::DataSourceGasFilenames,
                "Gas2019.csv.gz|Gas2020.csv.gz",
            )
            .with(
                ParameterName::DataSourceElectricityRootUrl,
                "https://example.org/energy",
            )
            .with(ParameterName::DataSourceElectricityFilenames, "Electricity2019.csv.gz")
            .with(ParameterName::WarehouseDatabase, "/tmp/warehouse.duckdb")
    }

    #[test]
    fn file_list_drops_empty_segments_and_keeps_order() {
        assert_eq!(
            parse_file_list("b.csv.gz| |a.csv.gz||"),
            vec!["b.csv.gz".to_owned(), "a.csv.gz".to_owned()]
        );
        assert!(parse_file_list("").is_empty());
        assert!(parse_file_list("||").is_empty());
    }

    #[test]
    fn only_exact_upper_y_enables() {
        assert!(parse_enabled(Some("Y")));
        assert!(!parse_enabled(Some("y")));
        assert!(!parse_enabled(Some("N")));
        assert!(!parse_enabled(Some("yes")));
        assert!(!parse_enabled(Some(" Y")));
        assert!(!parse_enabled(Some("Y ")));
        assert!(!parse_enabled(Some(" Y ")));
        assert!(!parse_enabled(None));
    }

    #[test]
    fn yes_no_flag_is_strict() {
        let name = ParameterName::DeleteDataFiles;
        assert!(parse_yes_no(name, Some("y")).unwrap());
        assert!(parse_yes_no(name, Some("Y")).unwrap());
        assert!(!parse_yes_no(name, Some("n")).unwrap());
        assert!(!parse_yes_no(name, None).unwrap());
        assert!(matches!(
            parse_yes_no(name, Some("maybe")),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn resolves_enabled_configuration_with_defaults() {
        let config = resolve("dev", &enabled_params()).unwrap();

        assert!(config.enabled);
        assert_eq!(config.environment_name, "dev");
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert!(!config.delete_after_load);
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert!((config.row_error_threshold - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.warehouse.schema, "energy");
        assert_eq!(config.file_count(), 3);

        let files: Vec<_> = config.files().collect();
        assert_eq!(
            files,
            vec![
                (Commodity::Gas, "http://example.org/energy/", "Gas2019.csv.gz"),
                (Commodity::Gas, "http://example.org/energy/", "Gas2020.csv.gz"),
                (
                    Commodity::Electricity,
                    "https://example.org/energy",
                    "Electricity2019.csv.gz"
                ),
            ]
        );
    }

    #[test]
    fn disabled_configuration_needs_no_sources() {
        let params = MapParameters::new().with(ParameterName::Enabled, "y");
        let config = resolve("prod", &params).unwrap();
        assert!(!config.enabled);
        assert!(config.commodity_sources.is_empty());
        assert_eq!(config.file_count(), 0);
    }

    #[test]
    fn padded_enable_flag_disables() {
        for value in [" Y ", "Y\n", "\tY"] {
            let params = MapParameters::new().with(ParameterName::Enabled, value);
            let config = resolve("prod", &params).unwrap();
            assert!(!config.enabled, "{value:?} must not enable the job");
        }
    }

    #[test]
    fn missing_source_parameter_is_named() {
        let params = MapParameters::new()
            .with(ParameterName::Enabled, "Y")
            .with(ParameterName::DataSourceGasRootUrl, "http://example.org/");
        let err = resolve("dev", &params).unwrap_err();
        match err {
            ConfigError::Missing { name } => assert_eq!(name, "CRUK_DATA_SOURCE_GAS_FILENAMES"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_bad_values() {
        let params = enabled_params().with(ParameterName::DeleteDataFiles, "sometimes");
        assert!(matches!(
            resolve("dev", &params),
            Err(ConfigError::Invalid { .. })
        ));

        let params = enabled_params().with(ParameterName::MaxConcurrency, "0");
        assert!(matches!(
            resolve("dev", &params),
            Err(ConfigError::Invalid { .. })
        ));

        let params = enabled_params().with(ParameterName::RowErrorThreshold, "1.5");
        assert!(matches!(
            resolve("dev", &params),
            Err(ConfigError::Invalid { .. })
        ));

        let params = enabled_params().with(ParameterName::DataSourceGasRootUrl, "ftp://x/");
        assert!(matches!(
            resolve("dev", &params),
            Err(ConfigError::Invalid { .. })
        ));

        let params =
            enabled_params().with(ParameterName::DataSourceGasFilenames, "../etc/passwd");
        assert!(matches!(
            resolve("dev", &params),
            Err(ConfigError::Invalid { .. })
        ));

        let params = enabled_params().with(ParameterName::WarehouseSchema, "energy; DROP");
        assert!(matches!(
            resolve("dev", &params),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn redacted_masks_notification_url() {
        let params = enabled_params().with(
            ParameterName::SecretNotificationUrl,
            "https://hooks.example.org/abc",
        );
        let config = resolve("dev", &params).unwrap();
        assert_eq!(
            config.notification_url.as_deref(),
            Some("https://hooks.example.org/abc")
        );
        assert_eq!(config.redacted().notification_url.as_deref(), Some("********"));
    }
}
