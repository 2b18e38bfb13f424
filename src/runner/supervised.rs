//! Supervised runner: executes the worker as a child process under an
//! external supervisor, polls its status, and harvests the result from
//! the shared cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{Runner, postmortem};
use crate::config::SupervisedConfig;
use crate::error::{MillError, Result};
use crate::session::Session;
use crate::supervisor::{ProcessDescription, ProcessSpec, ProcessState, SharedSupervisor};

/// Environment carried to the child so it can reconstruct the run.
pub const ENV_AGENT_ID: &str = "TASKMILL_AGENT";
pub const ENV_SETTINGS: &str = "TASKMILL_SETTINGS";
pub const ENV_CACHE: &str = "TASKMILL_CACHE";
pub const ENV_EXEC_FLAG: &str = "TASKMILL_EXEC_AGENT";

/// Derives the stable supervisor process name from a cache key.
pub type ProcNameHook = Arc<dyn Fn(&str) -> String + Send + Sync>;
/// Extra environment merged into every child process.
pub type EnvHook = Arc<dyn Fn(&Session) -> HashMap<String, String> + Send + Sync>;

enum Tick {
    Running,
    Clean,
    Failed(String),
}

pub struct SupervisedRunner {
    supervisor: SharedSupervisor,
    config: SupervisedConfig,
    check_interval: Duration,
    proc_name: ProcNameHook,
    env_hook: Option<EnvHook>,
}

impl SupervisedRunner {
    pub const NAME: &'static str = "supervised";

    pub fn new(supervisor: SharedSupervisor, config: SupervisedConfig, check_process_ms: u64) -> Self {
        let prefix = config.proc_name_prefix.clone();
        Self {
            supervisor,
            config,
            check_interval: Duration::from_millis(check_process_ms.max(1)),
            proc_name: Arc::new(move |key| format!("{prefix}{key}")),
            env_hook: None,
        }
    }

    pub fn with_proc_name(mut self, hook: ProcNameHook) -> Self {
        self.proc_name = hook;
        self
    }

    pub fn with_env_hook(mut self, hook: EnvHook) -> Self {
        self.env_hook = Some(hook);
        self
    }

    fn build_spec(&self, name: &str, session: &Session) -> ProcessSpec {
        let mut env = HashMap::new();
        env.insert(ENV_AGENT_ID.to_string(), session.agent_id.clone());
        env.insert(ENV_SETTINGS.to_string(), session.settings.to_string());
        env.insert(ENV_CACHE.to_string(), session.cache.clone());
        env.insert(ENV_EXEC_FLAG.to_string(), "1".to_string());
        if let Some(hook) = &self.env_hook {
            env.extend(hook(session));
        }

        ProcessSpec {
            name: name.to_string(),
            exec_file: self.config.exec_file.clone(),
            interpreter: self.config.interpreter.clone(),
            interpreter_args: self.config.interpreter_args.clone(),
            cwd: self.config.cwd.clone(),
            env,
            auto_restart: false,
        }
    }

    async fn execute(&self, session: &Session) -> Result<Option<Value>> {
        let name = (self.proc_name)(&session.cache_key);

        if self.supervisor.describe(&name).await?.is_some() {
            warn!(process = %name, "Supervised process already exists; deleting stale instance");
            self.supervisor.delete(&name).await?;
        }

        self.supervisor.start(self.build_spec(&name, session)).await?;
        // Whole-second precision: supervisor log timestamps carry no
        // sub-second component, and the post-mortem compares against them.
        let now = Utc::now();
        let started_at = now.with_nanosecond(0).unwrap_or(now);
        debug!(process = %name, agent = %session.agent_id, "Supervised process started");

        let polled = self.poll(&name, started_at).await;

        let (harvest, _) = tokio::join!(
            async {
                match &polled {
                    Ok(_) if session.agent.has_return => {
                        session.backend.get(&session.cache_key).await
                    }
                    _ => Ok(None),
                }
            },
            async {
                if let Err(e) = self.supervisor.delete(&name).await {
                    warn!(process = %name, error = %e, "Failed to delete supervised process entry");
                }
            }
        );

        polled?;
        harvest
    }

    async fn poll(&self, name: &str, started_at: DateTime<Utc>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut child_pid: Option<u32> = None;

        loop {
            ticker.tick().await;

            let Some(desc) = self.supervisor.describe(name).await? else {
                return Err(MillError::Runner("Process status unknown".into()));
            };
            if let Some(pid) = desc.pid.filter(|p| *p != 0) {
                child_pid = Some(pid);
            }

            match classify(&desc) {
                Tick::Running => continue,
                Tick::Clean => return self.post_mortem(name, child_pid, started_at).await,
                Tick::Failed(cause) => return Err(MillError::Runner(cause)),
            }
        }
    }

    async fn post_mortem(
        &self,
        name: &str,
        child_pid: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.config.log_file_scan {
            return Ok(());
        }
        let Some(path) = &self.config.log_file_path else {
            return Ok(());
        };

        match postmortem::analyze_log_tail(
            path,
            self.config.log_file_tail_size,
            child_pid,
            name,
            started_at,
        )
        .await
        {
            Ok(Some(cause)) => Err(MillError::Runner(cause)),
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Post-mortem log scan failed; assuming clean exit");
                Ok(())
            }
        }
    }
}

fn classify(desc: &ProcessDescription) -> Tick {
    match &desc.state {
        ProcessState::Launching => Tick::Running,
        ProcessState::Online if desc.pid.is_some_and(|p| p != 0) => Tick::Running,
        // Online with pid 0 is a supervisor quirk: the process is gone.
        ProcessState::Online | ProcessState::Stopping | ProcessState::Stopped => {
            match desc.exit_code.unwrap_or(0) {
                0 => Tick::Clean,
                code => {
                    let log = desc
                        .error_log_path
                        .as_ref()
                        .map(|p| format!(" (error log: {})", p.display()))
                        .unwrap_or_default();
                    Tick::Failed(format!("Process exited with code {code}{log}"))
                }
            }
        }
        ProcessState::Errored => Tick::Failed("Process errored".into()),
        ProcessState::Unknown(status) => Tick::Failed(format!("Unknown process status: {status}")),
    }
}

#[async_trait]
impl Runner for SupervisedRunner {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn exec(&self, session: &Session) -> Result<Option<Value>> {
        self.supervisor.connect().await?;
        let result = self.execute(session).await;
        self.supervisor.disconnect().await;
        result
    }
}
