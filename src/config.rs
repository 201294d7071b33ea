use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::batch::default_threads;
use crate::instrument::{DEFAULT_LOG_TAG, DEFAULT_TARGET_METHOD};

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "PERSPECTIVE_CONFIG";

/// Engine switches, resolved once per batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When false every input is copied through unchanged.
    pub enabled: bool,
    /// Whether the engine accepts incremental runs at all.
    pub enable_incremental: bool,
    pub target_method: String,
    pub log_tag: String,
    /// Worker pool size; `None` means one per available core.
    pub threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_incremental: true,
            target_method: DEFAULT_TARGET_METHOD.to_string(),
            log_tag: DEFAULT_LOG_TAG.to_string(),
            threads: None,
        }
    }
}

/// Command-line values that override the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config: Option<PathBuf>,
    pub disable: bool,
    pub no_incremental: bool,
    pub target_method: Option<String>,
    pub tag: Option<String>,
    pub threads: Option<usize>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// `--config`, else `PERSPECTIVE_CONFIG`, else defaults; then the
    /// command-line overrides; then validation.
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self> {
        let file = overrides
            .config
            .clone()
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };

        if overrides.disable {
            config.enabled = false;
        }
        if overrides.no_incremental {
            config.enable_incremental = false;
        }
        if let Some(m) = overrides.target_method.clone() {
            config.target_method = m;
        }
        if let Some(t) = overrides.tag.clone() {
            config.log_tag = t;
        }
        if let Some(n) = overrides.threads {
            config.threads = Some(n);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_method_name(&self.target_method) {
            anyhow::bail!("Invalid target method name: {:?}", self.target_method);
        }
        if self.log_tag.is_empty() {
            anyhow::bail!("Log tag must not be empty");
        }
        if self.threads == Some(0) {
            anyhow::bail!("Thread count must be at least 1");
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(default_threads)
    }
}

/// Unqualified JVM method name: non-empty, none of `. ; [ / < >`.
fn is_method_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', ';', '[', '/', '<', '>'])
}
