//! External process supervisor contract.
//!
//! The supervised runner delegates child-process lifecycle to a process
//! manager that names, starts, describes and deletes processes. Concrete
//! supervisors live outside this crate; anything satisfying [`Supervisor`]
//! can back the supervised runner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// What the supervisor is asked to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Stable name derived from the session's cache key.
    pub name: String,
    pub exec_file: PathBuf,
    pub interpreter: Option<String>,
    pub interpreter_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Carries the session identity to the child (agent id, serialized
    /// settings, cache name, exec flag).
    pub env: HashMap<String, String>,
    /// Always false for agent runs; a restarted worker would double-write.
    pub auto_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Launching,
    Online,
    Stopping,
    Stopped,
    Errored,
    Unknown(String),
}

impl ProcessState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Launching => "launching",
            Self::Online => "online",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
            Self::Unknown(s) => s,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One poll-loop observation of a named process.
#[derive(Debug, Clone)]
pub struct ProcessDescription {
    pub name: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub error_log_path: Option<PathBuf>,
}

/// Names, starts, describes and deletes child processes on behalf of the
/// supervised runner.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Never fails; called on every exec exit path.
    async fn disconnect(&self);

    async fn start(&self, spec: ProcessSpec) -> Result<()>;

    /// `None` when no process with that name exists.
    async fn describe(&self, name: &str) -> Result<Option<ProcessDescription>>;

    /// Terminates any live instance and removes the entry.
    async fn delete(&self, name: &str) -> Result<()>;
}

pub type SharedSupervisor = Arc<dyn Supervisor>;
