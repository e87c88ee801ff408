use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{Engine, EngineError};
use crate::notify::NotifyHub;

pub const CONFIG_FILE: &str = "roomy.toml";
pub const ENV_PREFIX: &str = "ROOMY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
    #[error("cannot prepare data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Figment(Box::new(e))
    }
}

/// Engine settings: built-in defaults, then `roomy.toml`, then `ROOMY_*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub journal_file: String,
    /// IANA zone used for recurrence and slot arithmetic.
    pub timezone: String,
    /// Journal appends after which the compactor rewrites the journal.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub reaper_interval_secs: u64,
    pub journal_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            journal_file: "roomy.wal".into(),
            timezone: "UTC".into(),
            compact_threshold: 1000,
            metrics_port: None,
            reaper_interval_secs: 60,
            journal_channel_capacity: 4096,
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = Self::figment().extract()?;
        config.tz()?;
        Ok(config)
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::UnknownTimeZone(self.timezone.clone()))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(&self.journal_file)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Create the data directory and open the engine on its journal.
    /// Must be called inside a tokio runtime.
    pub fn open_engine(&self, notify: Arc<NotifyHub>) -> Result<Engine, ConfigError> {
        let tz = self.tz()?;
        std::fs::create_dir_all(&self.data_dir)?;
        let engine = Engine::with_channel_capacity(&self.journal_path(), tz, notify, self.journal_channel_capacity)?;
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = Config::load().unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.journal_path(), PathBuf::from("./data/roomy.wal"));
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                timezone = "Europe/Berlin"
                compact_threshold = 50
                metrics_port = 9100
                "#,
            )?;
            jail.set_env("ROOMY_COMPACT_THRESHOLD", "75");
            jail.set_env("ROOMY_DATA_DIR", "/var/lib/roomy");

            let config = Config::load().unwrap();
            assert_eq!(config.timezone, "Europe/Berlin");
            assert_eq!(config.tz().unwrap(), chrono_tz::Europe::Berlin);
            assert_eq!(config.compact_threshold, 75);
            assert_eq!(config.metrics_port, Some(9100));
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/roomy"));
            assert_eq!(config.reaper_interval_secs, 60);
            Ok(())
        });
    }

    #[test]
    fn unknown_zone_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("ROOMY_TIMEZONE", "Mars/Olympus_Mons");
            assert!(matches!(Config::load(), Err(ConfigError::UnknownTimeZone(z)) if z == "Mars/Olympus_Mons"));
            Ok(())
        });
    }

    #[test]
    fn malformed_value_is_figment_error() {
        Jail::expect_with(|jail| {
            jail.set_env("ROOMY_REAPER_INTERVAL_SECS", "soon");
            assert!(matches!(Config::load(), Err(ConfigError::Figment(_))));
            Ok(())
        });
    }
}
