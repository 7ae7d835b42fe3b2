//! Migrator settings, loadable from a YAML or JSON file.

use crate::error::Error;
use crate::lock::DEFAULT_LOCK_TABLE;
use crate::parser::DocumentFormat;
use crate::sql::validate_table_name;
use crate::tracker::DEFAULT_CHANGELOG_TABLE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings shared by every operation of a [crate::Migrator].
///
/// Durations are written in seconds and may be fractional:
///
/// ```yaml
/// changelog_table: quillbase_changelog
/// lock_timeout: 300
/// lock_poll_interval: 0.5
/// busy_timeout: 30
/// accept_drift: false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub changelog_table: String,
    pub lock_table: String,
    /// How long to wait for the change log lock before failing.
    #[serde(with = "seconds")]
    pub lock_timeout: Duration,
    #[serde(with = "seconds")]
    pub lock_poll_interval: Duration,
    /// SQLite busy timeout set on the connection for the duration of a run.
    #[serde(with = "seconds")]
    pub busy_timeout: Duration,
    /// Write tracking rows in the same transaction as the schema changes.
    pub transactional_ddl: bool,
    /// Accept checksum mismatches instead of failing validation.
    pub accept_drift: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            changelog_table: DEFAULT_CHANGELOG_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            lock_timeout: Duration::from_secs(300),
            lock_poll_interval: Duration::from_millis(250),
            busy_timeout: Duration::from_secs(30),
            transactional_ddl: true,
            accept_drift: false,
        }
    }
}

impl MigratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = match DocumentFormat::from_path(path) {
            DocumentFormat::Json => {
                serde_json::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?
            }
            DocumentFormat::Yaml => {
                serde_yaml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_table_name(&self.changelog_table)?;
        validate_table_name(&self.lock_table)?;
        if self.changelog_table.eq_ignore_ascii_case(&self.lock_table) {
            return Err(Error::Config(format!(
                "tracking and lock tables must differ, both are '{}'",
                self.lock_table
            )));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(Error::Config(
                "lock_poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "expected a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
