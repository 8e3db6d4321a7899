use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::DaemonOpts;
use crate::engine::EngineSettings;
use crate::protocol::{backoff, kdf, VERSION};

/// Super subject created when the catalog is empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminConfig {
    pub name: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub version: String,
    pub kdf_rounds: u32,
    pub target_latency_ms: u64,
    pub block_step_ms: u64,
    pub idle_poll_ms: u64, // sleep when no session has work
    pub journal: Option<PathBuf>,
    pub admin: Option<AdminConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9040".to_string(),
            root: PathBuf::from("."),
            version: VERSION.to_string(),
            kdf_rounds: kdf::ROUNDS,
            target_latency_ms: backoff::TARGET_LATENCY_MS,
            block_step_ms: backoff::STEP_MS,
            idle_poll_ms: 20,
            journal: None,
            admin: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&data).with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// File settings (or defaults) with command-line values applied on top.
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut config = match &opts.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(bind) = &opts.bind {
            config.bind = bind.clone();
        }
        if let Some(root) = &opts.root {
            config.root = root.clone();
        }
        if let Some(journal) = &opts.journal {
            config.journal = Some(journal.clone());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_rounds == 0 {
            anyhow::bail!("kdf_rounds must be at least 1");
        }
        if self.version.is_empty() || self.version.split_ascii_whitespace().count() != 1 {
            anyhow::bail!("version must be a single non-empty token, got {:?}", self.version);
        }
        if let Some(admin) = &self.admin {
            if admin.name.is_empty() || admin.password.is_empty() {
                anyhow::bail!("admin name and password must not be empty");
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            version: self.version.clone(),
            kdf_rounds: self.kdf_rounds,
            target_latency_ms: self.target_latency_ms,
            block_step_ms: self.block_step_ms,
        }
    }
}
