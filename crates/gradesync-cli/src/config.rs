//! `gradesync.toml`: where state lives and which replicas make up the mesh.
//!
//! ```toml
//! data_dir = "state"
//!
//! [[replica]]
//! name = "postgresql"
//! backend = "sqlite"
//! path = "state/postgresql.db"   # optional
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gradesync::clock::{Clock, WallClock};
use gradesync::{OperationLog, Replica, ReplicaSet};
use gradesync_store::{open_store, BackendKind};
use serde::Deserialize;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "gradesync.toml";

/// Parsed configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the operation logs and merge histories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// The replicas, in declaration order.
    #[serde(rename = "replica", default)]
    pub replicas: Vec<ReplicaConfig>,
}

/// One `[[replica]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaConfig {
    /// Replica name, used in scripts and file names.
    pub name: String,
    /// Storage technology.
    pub backend: BackendKind,
    /// Store location; defaults to a file under `data_dir`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for Config {
    /// The three-system mesh: a relational, a document, and a batch-file
    /// replica.
    fn default() -> Self {
        let replica = |name: &str, backend| ReplicaConfig {
            name: name.to_string(),
            backend,
            path: None,
        };
        Self {
            data_dir: default_data_dir(),
            replicas: vec![
                replica("postgresql", BackendKind::Sqlite),
                replica("mongodb", BackendKind::Redb),
                replica("pig", BackendKind::Batch),
            ],
        }
    }
}

/// Error loading or validating the configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Io(PathBuf, std::io::Error),
    /// Failed to parse the TOML.
    Parse(String),
    /// The configuration is well-formed but unusable.
    Validation(Vec<String>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "cannot read {}: {e}", path.display()),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::Validation(errs) => {
                writeln!(f, "invalid configuration:")?;
                for e in errs {
                    writeln!(f, "  - {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load `path`, or `gradesync.toml` if present, or the default mesh.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no {DEFAULT_CONFIG_FILE}; using the default mesh");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(path, e)),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Check names and backends. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.replicas.is_empty() {
            errors.push("at least one [[replica]] is required".to_string());
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            let name = replica.name.trim();
            if name.is_empty() {
                errors.push("replica name must not be empty".to_string());
                continue;
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                errors.push(format!(
                    "replica name {name:?} may only contain letters, digits, '_' and '-'"
                ));
            }
            if !seen.insert(name.to_lowercase()) {
                errors.push(format!("replica {name:?} is declared more than once"));
            }
            if !replica.backend.is_available() {
                errors.push(format!(
                    "replica {name:?}: backend {} is not compiled into this build",
                    replica.backend
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Replica names, lower-cased, in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.replicas
            .iter()
            .map(|r| r.name.trim().to_lowercase())
            .collect()
    }

    /// Store location for `replica`.
    pub fn store_path(&self, replica: &ReplicaConfig) -> PathBuf {
        replica
            .path
            .clone()
            .unwrap_or_else(|| replica.backend.default_path(&self.data_dir, replica.name.trim()))
    }

    /// Open every store and log, sharing one clock.
    pub fn open(&self) -> Result<ReplicaSet, Box<dyn std::error::Error>> {
        let clock: Arc<dyn Clock> = Arc::new(WallClock::new());
        let names = self.names();
        let mut set = ReplicaSet::new();

        for replica in &self.replicas {
            let name = replica.name.trim();
            let store = open_store(replica.backend, &self.store_path(replica))?;
            let log = OperationLog::open(&self.data_dir, name, names.iter().map(String::as_str));
            set.insert(Replica::new(name, log, store, clock.clone()))?;
        }
        Ok(set)
    }
}
