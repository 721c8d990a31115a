//! Application configuration for pubflow.
//!
//! User config lives at `~/.pubflow/pubflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::WorkflowStep;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pubflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pubflow";

// ---------------------------------------------------------------------------
// Config structs (matching pubflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Audit sink settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// External commands per step, keyed by step name (`[executors.tested]`).
    #[serde(default)]
    pub executors: BTreeMap<String, CommandSpec>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path of the persisted state document.
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Worker pool size per step batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_state_path() -> String {
    ".pubflow/state.json".into()
}
fn default_concurrency() -> usize {
    10
}

/// `[audit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append checkpoints to this JSON Lines file, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<String>,

    /// Emit each checkpoint as a structured log event.
    #[serde(default = "default_true")]
    pub tracing: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            tracing: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[executors.<step>]` entry: the external command that performs a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run.
    pub command: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Kill the command and fail the step after this many seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Working directory for the command (defaults to the current directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

fn default_timeout_secs() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime configuration for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Path of the persisted state document.
    pub state_path: PathBuf,
    /// Worker pool size per step batch.
    pub concurrency: usize,
    /// JSON Lines audit file, if enabled.
    pub audit_jsonl: Option<PathBuf>,
    /// Whether checkpoints are also logged through `tracing`.
    pub audit_tracing: bool,
    /// Commands for steps that have one configured.
    pub executors: BTreeMap<WorkflowStep, CommandSpec>,
}

impl TryFrom<&AppConfig> for RunConfig {
    type Error = PipelineError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        if config.defaults.concurrency == 0 {
            return Err(PipelineError::config("defaults.concurrency must be at least 1"));
        }

        let mut executors = BTreeMap::new();
        for (name, spec) in &config.executors {
            let step: WorkflowStep = name
                .parse()
                .map_err(|e| PipelineError::config(format!("[executors.{name}]: {e}")))?;
            if spec.command.trim().is_empty() {
                return Err(PipelineError::config(format!(
                    "[executors.{name}]: command must not be empty"
                )));
            }
            executors.insert(step, spec.clone());
        }

        Ok(Self {
            state_path: PathBuf::from(&config.defaults.state_path),
            concurrency: config.defaults.concurrency,
            audit_jsonl: config.audit.jsonl_path.as_ref().map(PathBuf::from),
            audit_tracing: config.audit.tracing,
            executors,
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pubflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pubflow/pubflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
