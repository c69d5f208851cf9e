// Runtime configuration - TOML file with defaults for every key

use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// SQLite file holding the two staging tables
    pub database_path: PathBuf,

    /// Directory that receives report artifacts
    pub output_dir: PathBuf,

    /// Artifact stem: `<prefix>-<UTC timestamp>.xlsx`
    pub report_prefix: String,

    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for ReconConfig {
    fn default() -> Self {
        ReconConfig {
            database_path: PathBuf::from("./pdb.sqlite"),
            output_dir: PathBuf::from("./uploads"),
            report_prefix: "result".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ReconConfig {
    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ReconConfig =
            toml::from_str(text).map_err(|e| ReconError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or return defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = fs::read_to_string(p).map_err(|e| ReconError::io(p, e))?;
                Self::from_toml_str(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn with_database_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(p) = path {
            self.database_path = p;
        }
        self
    }

    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(d) = dir {
            self.output_dir = d;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        let prefix = self.report_prefix.trim();
        if prefix.is_empty() {
            return Err(ReconError::Config("report_prefix must not be empty".to_string()));
        }
        if prefix.contains(['/', '\\']) {
            return Err(ReconError::Config(format!(
                "report_prefix '{}' must be a bare file stem",
                prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = ReconConfig::from_toml_str("").unwrap();
        assert_eq!(config, ReconConfig::default());
        assert_eq!(config.report_prefix, "result");
    }

    #[test]
    fn test_partial_document_overrides_only_named_keys() {
        let config = ReconConfig::from_toml_str(
            r#"
            output_dir = "/srv/reports"
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.output_dir, PathBuf::from("/srv/reports"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.database_path, PathBuf::from("./pdb.sqlite"));
    }

    #[test]
    fn test_prefix_with_separator_rejected() {
        let err = ReconConfig::from_toml_str(r#"report_prefix = "../escape""#).unwrap_err();
        assert!(matches!(err, ReconError::Config(_)));
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = ReconConfig::default()
            .with_database_path(Some(PathBuf::from("other.sqlite")))
            .with_output_dir(None);

        assert_eq!(config.database_path, PathBuf::from("other.sqlite"));
        assert_eq!(config.output_dir, PathBuf::from("./uploads"));
    }
}
