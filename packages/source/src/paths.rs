//! Staging file layout.
//!
//! Downloads land in `{staging_dir}/raw/{commodity}/{file_name}`, so two
//! files never share a path within a run.

use std::path::{Path, PathBuf};

use energy_usage_models::Commodity;

/// Returns the `raw/` directory under the staging root.
#[must_use]
pub fn raw_dir(staging_dir: &Path) -> PathBuf {
    staging_dir.join("raw")
}

/// Returns the staging path for one source file.
#[must_use]
pub fn staging_path(staging_dir: &Path, commodity: Commodity, file_name: &str) -> PathBuf {
    raw_dir(staging_dir).join(commodity.as_ref()).join(file_name)
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_separates_commodities() {
        let root = Path::new("/var/staging");
        assert_eq!(
            staging_path(root, Commodity::Gas, "Gas2019.csv.gz"),
            PathBuf::from("/var/staging/raw/gas/Gas2019.csv.gz")
        );
        assert_eq!(
            staging_path(root, Commodity::Electricity, "Electricity2019.csv.gz"),
            PathBuf::from("/var/staging/raw/electricity/Electricity2019.csv.gz")
        );
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let root =
            std::env::temp_dir().join(format!("energy_usage_paths_test-{}", std::process::id()));
        let dir = root.join("a/b");
        let _ = std::fs::remove_dir_all(&root);
        ensure_dir(&dir).unwrap();
        ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(&root);
    }
}
