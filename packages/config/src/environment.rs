//! Runtime environment probes and a redacted dump of job parameters.

use crate::parameters::ENV_PREFIX;

const SENSITIVE_MARKERS: [&str; 4] = ["SECRET", "TOKEN", "PASSWORD", "PASSPHRASE"];

/// Returns `true` when the container image sets `RUNNINGINCONTAINER=1`.
#[must_use]
pub fn is_running_in_container() -> bool {
    std::env::var("RUNNINGINCONTAINER").is_ok_and(|v| v.trim() == "1")
}

/// Returns `true` when running as an ECS task.
#[must_use]
pub fn is_running_in_aws() -> bool {
    std::env::var_os("ECS_CONTAINER_METADATA_URI_V4").is_some()
}

/// Returns `true` if the variable name suggests the value is a credential.
#[must_use]
pub fn is_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Value as it should appear in logs. Sensitive values are reduced to
/// their length.
#[must_use]
pub fn redact(name: &str, value: &str) -> String {
    if is_sensitive(name) {
        format!("<redacted, {} chars>", value.chars().count())
    } else {
        value.to_owned()
    }
}

/// Logs every `CRUK_` variable at debug level, with credentials masked.
pub fn log_environment() {
    log::debug!(
        "Runtime: container={} aws={}",
        is_running_in_container(),
        is_running_in_aws()
    );

    for line in redacted_parameters(std::env::vars()) {
        log::debug!("{line}");
    }
}

/// `NAME=value` lines for every `CRUK_` variable in `vars`, sorted by
/// name, with credentials masked.
pub fn redacted_parameters(vars: impl IntoIterator<Item = (String, String)>) -> Vec<String> {
    let mut vars: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(name, _)| name.starts_with(ENV_PREFIX))
        .collect();
    vars.sort();

    vars.into_iter()
        .map(|(name, value)| format!("{name}={}", redact(&name, &value)))
        .collect()
}
