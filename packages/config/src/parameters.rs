//! Named string parameters and the places they can come from.
//!
//! In a deployed environment every parameter is an environment variable
//! prefixed with `CRUK_` (secrets use `CRUK_SECRET_`). For local runs the
//! same parameters can live in a TOML file with one table per environment:
//!
//! ```toml
//! [environments.dev]
//! enabled = "Y"
//! data_source_gas_root_url = "http://example.org/energy/"
//! data_source_gas_filenames = ["Gas2019.csv.gz", "Gas2020.csv.gz"]
//! ```
//!
//! [`LayeredParameters`] stacks sources so environment variables override
//! the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr as _;

use energy_usage_models::Commodity;
use serde::Deserialize;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::ConfigError;

/// Prefix applied to every parameter exposed as an environment variable.
pub const ENV_PREFIX: &str = "CRUK_";

/// Every parameter the job understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ParameterName {
    Enabled,
    ServiceName,
    EnvironmentName,
    DataSourceGasRootUrl,
    DataSourceGasFilenames,
    DataSourceElectricityRootUrl,
    DataSourceElectricityFilenames,
    DeleteDataFiles,
    WorkingDirectory,
    WarehouseDatabase,
    WarehouseSchema,
    MaxConcurrency,
    RowErrorThreshold,
    FetchMaxAttempts,
    FetchBackoffMs,
    FetchTimeoutSecs,
    SecretNotificationUrl,
}

impl ParameterName {
    /// Environment variable name, e.g. `CRUK_ENABLED`.
    #[must_use]
    pub fn env_key(self) -> String {
        format!("{ENV_PREFIX}{self}")
    }

    /// Key used inside a TOML environment table, e.g. `enabled`.
    #[must_use]
    pub fn file_key(self) -> String {
        self.as_ref().to_ascii_lowercase()
    }

    /// Root URL parameter for a commodity.
    #[must_use]
    pub const fn root_url(commodity: Commodity) -> Self {
        match commodity {
            Commodity::Gas => Self::DataSourceGasRootUrl,
            Commodity::Electricity => Self::DataSourceElectricityRootUrl,
        }
    }

    /// Pipe-delimited file list parameter for a commodity.
    #[must_use]
    pub const fn file_names(commodity: Commodity) -> Self {
        match commodity {
            Commodity::Gas => Self::DataSourceGasFilenames,
            Commodity::Electricity => Self::DataSourceElectricityFilenames,
        }
    }
}

/// Read-only lookup of named parameters.
pub trait ParameterSource: Send + Sync {
    /// Returns the raw value of `name`, or `None` if this source does not
    /// define it.
    fn get(&self, name: ParameterName) -> Option<String>;
}

/// Parameters read from `CRUK_`-prefixed process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvParameters;

impl ParameterSource for EnvParameters {
    fn get(&self, name: ParameterName) -> Option<String> {
        std::env::var(name.env_key()).ok()
    }
}

/// Parameters held in memory. Handy for tests and for CLI overrides.
#[derive(Debug, Default, Clone)]
pub struct MapParameters {
    values: BTreeMap<ParameterName, String>,
}

impl MapParameters {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a value.
    #[must_use]
    pub fn with(mut self, name: ParameterName, value: impl Into<String>) -> Self {
        self.values.insert(name, value.into());
        self
    }
}

impl ParameterSource for MapParameters {
    fn get(&self, name: ParameterName) -> Option<String> {
        self.values.get(&name).cloned()
    }
}

#[derive(Debug, Deserialize)]
struct ParameterFile {
    #[serde(default)]
    environments: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

/// Parameters for one environment, read from a TOML parameter file.
#[derive(Debug, Clone)]
pub struct TomlParameters {
    environment: String,
    values: MapParameters,
}

impl TomlParameters {
    /// Reads the table for `environment` from the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, the
    /// environment has no table, or a key is not a known parameter.
    pub fn from_path(path: &Path, environment: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents, environment)
    }

    /// Parses the table for `environment` from TOML text.
    ///
    /// Strings are taken as-is, numbers are formatted, booleans become
    /// `Y`/`N`, and string arrays are joined with `|` so file lists can be
    /// written as TOML arrays.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed TOML, an unknown environment, an
    /// unknown key, or an unsupported value type.
    pub fn parse(contents: &str, environment: &str) -> Result<Self, ConfigError> {
        let mut file: ParameterFile = toml::from_str(contents)?;

        let Some(table) = file.environments.remove(environment) else {
            return Err(ConfigError::UnknownEnvironment {
                name: environment.to_owned(),
                available: file.environments.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        };

        let mut values = MapParameters::new();
        for (key, value) in table {
            let name = ParameterName::from_str(&key)
                .map_err(|_| ConfigError::UnknownParameter { name: key.clone() })?;
            values = values.with(name, toml_value_to_string(&key, &value)?);
        }

        Ok(Self {
            environment: environment.to_owned(),
            values,
        })
    }

    /// Environment whose table was loaded.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl ParameterSource for TomlParameters {
    fn get(&self, name: ParameterName) -> Option<String> {
        self.values.get(name)
    }
}

fn toml_value_to_string(key: &str, value: &toml::Value) -> Result<String, ConfigError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(if *b { "Y" } else { "N" }.to_owned()),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_owned).ok_or_else(|| ConfigError::Invalid {
                    name: key.to_owned(),
                    value: item.to_string(),
                    reason: "array items must be strings".to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|names| names.join("|")),
        other => Err(ConfigError::Invalid {
            name: key.to_owned(),
            value: other.to_string(),
            reason: "unsupported value type".to_owned(),
        }),
    }
}

/// Stack of sources; the first source that defines a parameter wins.
#[derive(Default)]
pub struct LayeredParameters {
    layers: Vec<Box<dyn ParameterSource>>,
}

impl LayeredParameters {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer below the existing ones.
    #[must_use]
    pub fn then(mut self, source: impl ParameterSource + 'static) -> Self {
        self.layers.push(Box::new(source));
        self
    }
}

impl ParameterSource for LayeredParameters {
    fn get(&self, name: ParameterName) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_and_file_keys() {
        assert_eq!(ParameterName::Enabled.env_key(), "CRUK_ENABLED");
        assert_eq!(
            ParameterName::SecretNotificationUrl.env_key(),
            "CRUK_SECRET_NOTIFICATION_URL"
        );
        assert_eq!(
            ParameterName::DataSourceGasRootUrl.env_key(),
            "CRUK_DATA_SOURCE_GAS_ROOT_URL"
        );
        assert_eq!(
            ParameterName::DataSourceElectricityFilenames.file_key(),
            "data_source_electricity_filenames"
        );
    }

    #[test]
    fn toml_parameters_select_environment() {
        let contents = r#"
            [environments.dev]
            enabled = "Y"
            data_source_gas_filenames = ["Gas2019.csv.gz", "Gas2020.csv.gz"]
            max_concurrency = 2
            delete_data_files = true

            [environments.prod]
            enabled = "N"
        "#;

        let dev = TomlParameters::parse(contents, "dev").unwrap();
        assert_eq!(dev.environment(), "dev");
        assert_eq!(dev.get(ParameterName::Enabled).as_deref(), Some("Y"));
        assert_eq!(
            dev.get(ParameterName::DataSourceGasFilenames).as_deref(),
            Some("Gas2019.csv.gz|Gas2020.csv.gz")
        );
        assert_eq!(dev.get(ParameterName::MaxConcurrency).as_deref(), Some("2"));
        assert_eq!(dev.get(ParameterName::DeleteDataFiles).as_deref(), Some("Y"));

        let prod = TomlParameters::parse(contents, "prod").unwrap();
        assert_eq!(prod.get(ParameterName::Enabled).as_deref(), Some("N"));
        assert!(prod.get(ParameterName::DataSourceGasFilenames).is_none());
    }

    #[test]
    fn toml_parameters_reject_unknown_environment_and_keys() {
        let contents = "[environments.dev]\nenabled = \"Y\"\n";
        let err = TomlParameters::parse(contents, "stg").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment { .. }));

        let contents = "[environments.dev]\nenabeld = \"Y\"\n";
        let err = TomlParameters::parse(contents, "dev").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownParameter { .. }));
    }

    #[test]
    fn layers_prefer_earlier_sources() {
        let top = MapParameters::new().with(ParameterName::Enabled, "N");
        let bottom = MapParameters::new()
            .with(ParameterName::Enabled, "Y")
            .with(ParameterName::ServiceName, "svc");
        let layered = LayeredParameters::new().then(top).then(bottom);

        assert_eq!(layered.get(ParameterName::Enabled).as_deref(), Some("N"));
        assert_eq!(layered.get(ParameterName::ServiceName).as_deref(), Some("svc"));
        assert!(layered.get(ParameterName::SecretNotificationUrl).is_none());
    }

    #[test]
    fn bundled_environment_file_parses_for_every_environment() {
        let contents = include_str!("../../../config/environments.toml");
        for env in ["sbox", "dev", "test", "prod"] {
            TomlParameters::parse(contents, env)
                .unwrap_or_else(|e| panic!("environment {env} failed to parse: {e}"));
        }
    }
}
