//! Storage configuration: defaults, optional TOML file, environment overrides.

use crate::store::GroveError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`GroveConfig::db_path`]
pub const ENV_DB_PATH: &str = "GROVE_DB_PATH";

/// Environment variable overriding [`GroveConfig::max_connections`]
pub const ENV_MAX_CONNECTIONS: &str = "GROVE_MAX_CONNECTIONS";

/// Configuration for Grove storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroveConfig {
    /// Path to SQLite database
    pub db_path: PathBuf,

    /// Upper bound on pooled connections
    pub max_connections: u32,

    /// How long a writer waits on a locked database before failing (seconds)
    pub busy_timeout_secs: u64,
}

impl Default for GroveConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_db_path(),
            max_connections: 5,
            busy_timeout_secs: 5,
        }
    }
}

impl GroveConfig {
    /// Configuration for a database at `db_path`, other settings default
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Read `path` if it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, GroveError> {
        let config = match path {
            Some(path) if path.exists() => Self::from_toml_file(path)?,
            _ => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, GroveError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GroveError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
            .map_err(|e| GroveError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, GroveError> {
        toml::from_str(raw).map_err(|e| GroveError::Config(e.to_string()))
    }

    /// Apply overrides from a variable lookup (the process environment in `load`)
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GroveError> {
        if let Some(path) = lookup(ENV_DB_PATH) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_MAX_CONNECTIONS) {
            self.max_connections = raw.parse().map_err(|e| {
                GroveError::Config(format!("{ENV_MAX_CONNECTIONS}={raw:?}: {e}"))
            })?;
        }
        Ok(self)
    }

    /// Default location of the database when none is configured
    pub fn default_db_path() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("grove").join("grove.db"))
            .unwrap_or_else(|| PathBuf::from("grove.db"))
    }
}
