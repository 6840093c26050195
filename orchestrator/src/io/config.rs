//! Orchestrator configuration stored in `orchestrator.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::validate::NameCatalog;
use crate::executor::ExecutorConfig;

/// Orchestrator configuration (TOML).
///
/// Missing fields default to values suitable for interactive sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent capability calls within one layer.
    pub max_parallel: usize,

    /// Per-call capability timeout in milliseconds.
    pub step_timeout_ms: u64,

    #[serde(rename = "loop")]
    pub looping: LoopConfig,

    pub trace: TraceConfig,

    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { max_iterations: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TraceConfig {
    /// Directory receiving one subdirectory per exported run.
    pub export_dir: PathBuf,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from(".orchestrator/traces"),
        }
    }
}

/// Capability and gate names the CLI treats as registered when validating
/// plan documents offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    pub capabilities: Vec<String>,
    pub gates: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            step_timeout_ms: 60_000,
            looping: LoopConfig::default(),
            trace: TraceConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.step_timeout_ms == 0 {
            return Err(anyhow!("step_timeout_ms must be > 0"));
        }
        if self.looping.max_iterations == 0 {
            return Err(anyhow!("loop.max_iterations must be > 0"));
        }
        if self.trace.export_dir.as_os_str().is_empty() {
            return Err(anyhow!("trace.export_dir must not be empty"));
        }
        let mut names = self.catalog.capabilities.iter().chain(&self.catalog.gates);
        if names.any(|name| name.trim().is_empty()) {
            return Err(anyhow!("catalog names must be non-empty"));
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_parallel: self.max_parallel,
            step_timeout: Duration::from_millis(self.step_timeout_ms),
        }
    }

    pub fn name_catalog(&self) -> NameCatalog {
        NameCatalog::new(
            self.catalog.capabilities.iter().cloned(),
            self.catalog.gates.iter().cloned(),
        )
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))
}
