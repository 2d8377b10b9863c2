use std::path::{Path, PathBuf};
use std::time::Duration;

use dotenvy::dotenv;
use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use tether_core::{PersistenceConfig, RuntimeConfig};

use super::Cli;

pub fn load_env() -> Result<()> {
    dotenv().ok();
    Ok(())
}

/// Settings read from the `--config` TOML file. Command-line flags take
/// precedence, see [`CliConfig::with_flags`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub session_db: Option<PathBuf>,
    pub memory: bool,
    pub log_dir: Option<PathBuf>,
    pub observer_buffer: Option<usize>,
    pub delta_buffer: Option<usize>,
    pub backend: BackendSettings,
}

/// Options for the built-in echo backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSettings {
    /// Emit a reasoning part before the reply.
    pub reasoning: bool,
    /// Pause between streamed chunks, in milliseconds.
    pub chunk_delay_ms: Option<u64>,
}

impl BackendSettings {
    pub fn chunk_delay(&self) -> Option<Duration> {
        self.chunk_delay_ms.map(Duration::from_millis)
    }
}

impl CliConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    /// Reads `path`, or returns the defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    pub fn with_flags(mut self, cli: &Cli) -> Self {
        if cli.session_db.is_some() {
            self.session_db.clone_from(&cli.session_db);
        }
        if cli.log_dir.is_some() {
            self.log_dir.clone_from(&cli.log_dir);
        }
        self.memory |= cli.memory;
        self
    }

    pub fn persistence(&self) -> Result<PersistenceConfig> {
        if self.memory {
            return Ok(PersistenceConfig::Memory);
        }
        match &self.session_db {
            Some(path) => Ok(PersistenceConfig::sqlite(path)),
            None => PersistenceConfig::default_sqlite()
                .map_err(|e| eyre!("Failed to locate session database: {}", e)),
        }
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = RuntimeConfig::default().with_persistence(self.persistence()?);
        if let Some(capacity) = self.observer_buffer {
            config = config.with_observer_buffer(capacity);
        }
        if let Some(capacity) = self.delta_buffer {
            config = config.with_delta_buffer(capacity);
        }
        Ok(config)
    }
}
