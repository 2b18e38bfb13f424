use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{MillError, Result};

/// Supervised-runner poll interval.
pub const DEFAULT_CHECK_PROCESS_MS: u64 = 1000;
/// Throttled-log window.
pub const DEFAULT_LOG_THROTTLE_MS: u64 = 250;
/// Bytes read from the end of the supervisor log during post-mortem.
pub const DEFAULT_TAIL_SIZE: u64 = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MillConfig {
    /// Run `init` as part of orchestrator construction.
    pub auto_init: bool,
    /// Install cron tasks for timed agents on init.
    pub auto_install: bool,
    /// Honor the `immediate` flag on agents at init.
    pub allow_immediate: bool,
    /// Supervised-runner poll interval in milliseconds.
    pub check_process_ms: u64,
    /// Throttled-log window in milliseconds.
    pub log_throttle_ms: u64,
    /// Globs handed to agent sources that discover definitions on disk.
    pub paths: Vec<String>,
    pub runner: RunnerConfig,
    pub cache: CacheConfig,
    pub agent_defaults: AgentDefaults,
}

impl Default for MillConfig {
    fn default() -> Self {
        Self {
            auto_init: false,
            auto_install: true,
            allow_immediate: true,
            check_process_ms: DEFAULT_CHECK_PROCESS_MS,
            log_throttle_ms: DEFAULT_LOG_THROTTLE_MS,
            paths: Vec::new(),
            runner: RunnerConfig::default(),
            cache: CacheConfig::default(),
            agent_defaults: AgentDefaults::default(),
        }
    }
}

impl MillConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)
                .map_err(|e| MillError::InvalidDefinition {
                    id: path.display().to_string(),
                    reason: e.to_string(),
                })?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_process_ms == 0 {
            return Err(MillError::InvalidDefinition {
                id: "check_process_ms".into(),
                reason: "poll interval must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Runner selection. `modules` restricts which registered runners are
/// enabled; empty means all registered runners are enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub modules: Vec<String>,
    pub supervised: SupervisedConfig,
}

impl RunnerConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.modules.is_empty() || self.modules.iter().any(|m| m == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisedConfig {
    /// Executable the supervisor starts for every agent run.
    pub exec_file: PathBuf,
    /// Optional interpreter wrapped around `exec_file`.
    pub interpreter: Option<String>,
    pub interpreter_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Prefix for derived process names; the default proc-name hook
    /// produces `<prefix><cacheKey>`.
    pub proc_name_prefix: String,
    /// Mine the supervisor log after a clean exit to distinguish a worker
    /// exit from a supervisor-initiated kill.
    pub log_file_scan: bool,
    pub log_file_path: Option<PathBuf>,
    pub log_file_tail_size: u64,
}

impl Default for SupervisedConfig {
    fn default() -> Self {
        Self {
            exec_file: PathBuf::from("taskmill-agent"),
            interpreter: None,
            interpreter_args: Vec::new(),
            cwd: None,
            proc_name_prefix: "taskmill-".into(),
            log_file_scan: true,
            log_file_path: None,
            log_file_tail_size: DEFAULT_TAIL_SIZE,
        }
    }
}

/// Cache backend selection. Same enablement rule as `RunnerConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub modules: Vec<String>,
}

impl CacheConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.modules.is_empty() || self.modules.iter().any(|m| m == name)
    }
}

/// Defaults merged into every discovered agent definition where the
/// definition itself is silent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    pub expires: Option<String>,
    pub methods: Vec<String>,
    pub show: Option<bool>,
    pub clear_on_build: Option<bool>,
}
