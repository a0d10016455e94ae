//! Configuration for the demo binary only — the library itself takes
//! explicit [`crate::MirrorOptions`]/[`crate::UpdateOptions`] structs and
//! never reads a config file (see §4.14 of the design notes).

use serde::Deserialize;

use crate::error::MirrorError;

/// The on-disk TOML shape `mirror-demo` loads: where to keep the SQLite
/// database and the four batching limits passed to every `update` step.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    pub database_path: String,
    #[serde(default = "default_nodes_limit")]
    pub nodes_limit: usize,
    #[serde(default = "default_nodes_of_type_limit")]
    pub nodes_of_type_limit: usize,
    #[serde(default = "default_connection_limit")]
    pub connection_limit: usize,
    #[serde(default = "default_connection_page_size")]
    pub connection_page_size: usize,
}

fn default_nodes_limit() -> usize {
    500
}

fn default_nodes_of_type_limit() -> usize {
    100
}

fn default_connection_limit() -> usize {
    200
}

fn default_connection_page_size() -> usize {
    50
}

impl DemoConfig {
    /// Loads `path` (TOML) via the `config` crate, matching the teacher's
    /// `AppConfig::load` pattern.
    pub fn load(path: &str) -> Result<Self, MirrorError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|err| MirrorError::Consistency(format!("failed to load {path}: {err}")))?;

        settings
            .try_deserialize()
            .map_err(|err| MirrorError::Consistency(format!("invalid config {path}: {err}")))
    }

    /// Rejects a config whose limits can't make progress.
    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.database_path.trim().is_empty() {
            return Err(MirrorError::Consistency(
                "database_path must not be empty".to_string(),
            ));
        }
        if self.nodes_limit == 0
            || self.nodes_of_type_limit == 0
            || self.connection_limit == 0
            || self.connection_page_size == 0
        {
            return Err(MirrorError::Consistency(
                "all update limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_database_path() {
        let config = DemoConfig {
            database_path: String::new(),
            nodes_limit: 1,
            nodes_of_type_limit: 1,
            connection_limit: 1,
            connection_page_size: 1,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_limit() {
        let config = DemoConfig {
            database_path: "db.sqlite".to_string(),
            nodes_limit: 0,
            nodes_of_type_limit: 1,
            connection_limit: 1,
            connection_page_size: 1,
        };
        assert!(config.validate().is_err());
    }
}
