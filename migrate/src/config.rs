// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with migration engine configuration.

use camino::Utf8PathBuf;
use dropshot::{ConfigDropshot, ConfigLogging};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine tuning knobs; every field has a production-safe default.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tuning {
    /// Cap on concurrent storage migrations on this node.
    #[serde(default = "default_max_storage_migrations")]
    pub max_storage_migrations: u32,

    /// Allows the shared-SR short-circuit for clusters whose source and
    /// destination see the same storage.  The coordination needed to
    /// hand off the active datapath in that mode is not implemented, so
    /// this stays off unless a deployment explicitly opts in.
    #[serde(default)]
    pub shared_sr_mode: bool,

    /// How often to poll storage-agent tasks for progress.
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Directory scanned for fault-injection flag files; unset in
    /// production.
    #[serde(default)]
    pub fist_dir: Option<Utf8PathBuf>,
}

fn default_max_storage_migrations() -> u32 {
    3
}

fn default_task_poll_interval_ms() -> u64 {
    1000
}

impl Default for Tuning {
    fn default() -> Tuning {
        Tuning {
            max_storage_migrations: default_max_storage_migrations(),
            shared_sr_mode: false,
            task_poll_interval_ms: default_task_poll_interval_ms(),
            fist_dir: None,
        }
    }
}

impl Tuning {
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }
}

/// Configuration for the migration engine daemon.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Debug log configuration.
    pub log: ConfigLogging,
    /// HTTP server configuration.
    #[serde(default)]
    pub dropshot: ConfigDropshot,
    #[serde(default)]
    pub tuning: Tuning,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults() {
        let tuning = Tuning::default();
        assert_eq!(tuning.max_storage_migrations, 3);
        assert!(!tuning.shared_sr_mode);
        assert_eq!(tuning.task_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn parses_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [tuning]
            max_storage_migrations = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.tuning.max_storage_migrations, 5);
        assert!(config.tuning.fist_dir.is_none());
    }
}
