//! Test doubles: a scriptable supervisor and canned workers.
//!
//! `FakeSupervisor` drives the supervised runner through scripted status
//! sequences or a simulated child body, without a real process manager.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::agent::{Worker, worker_fn};
use crate::error::{MillError, Result};
use crate::supervisor::{ProcessDescription, ProcessSpec, ProcessState, Supervisor};

/// Simulated child body: receives the process spec, returns an exit code.
pub type ChildFn = Arc<dyn Fn(ProcessSpec) -> BoxFuture<'static, i32> + Send + Sync>;

struct LiveProcess {
    pid: u32,
    state: ProcessState,
    exit_code: Option<i32>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    next_pid: u32,
    processes: HashMap<String, LiveProcess>,
    script: HashMap<String, VecDeque<ProcessDescription>>,
    preloaded: HashMap<String, ProcessDescription>,
    started: HashSet<String>,
    started_specs: Vec<ProcessSpec>,
    deleted: Vec<String>,
    connects: usize,
    disconnects: usize,
    fail_delete: bool,
}

pub struct FakeSupervisor {
    state: Arc<Mutex<State>>,
    child: Option<ChildFn>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_pid: 1000,
                ..Default::default()
            })),
            child: None,
        }
    }

    /// Run this body for every started process; describe() reports the
    /// process online until the body returns, then stopped with its exit
    /// code.
    pub fn with_child(mut self, child: ChildFn) -> Self {
        self.child = Some(child);
        self
    }

    /// Serve these descriptions, in order, for post-start describes of
    /// `name`. The last entry repeats.
    pub fn script(self, name: &str, descriptions: Vec<ProcessDescription>) -> Self {
        self.state
            .lock()
            .script
            .insert(name.to_string(), descriptions.into());
        self
    }

    /// Pretend a process with this name already exists before any start.
    pub fn preload(self, description: ProcessDescription) -> Self {
        self.state
            .lock()
            .preloaded
            .insert(description.name.clone(), description);
        self
    }

    pub fn fail_deletes(self) -> Self {
        self.state.lock().fail_delete = true;
        self
    }

    /// Force a process into the stopped state with the given exit code,
    /// aborting any simulated child body.
    pub fn kill(&self, name: &str, exit_code: i32) {
        let mut state = self.state.lock();
        if let Some(process) = state.processes.get_mut(name) {
            process.state = ProcessState::Stopped;
            process.exit_code = Some(exit_code);
            if let Some(handle) = process.handle.take() {
                handle.abort();
            }
        }
    }

    pub fn pid_of(&self, name: &str) -> Option<u32> {
        self.state.lock().processes.get(name).map(|p| p.pid)
    }

    pub fn started_specs(&self) -> Vec<ProcessSpec> {
        self.state.lock().started_specs.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn connect(&self) -> Result<()> {
        self.state.lock().connects += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().disconnects += 1;
    }

    async fn start(&self, spec: ProcessSpec) -> Result<()> {
        let name = spec.name.clone();
        {
            let mut state = self.state.lock();
            state.next_pid += 1;
            let pid = state.next_pid;
            let live = self.child.is_some() || state.script.contains_key(&name);
            state.started.insert(name.clone());
            state.started_specs.push(spec.clone());
            // The entry must exist before any child body can finish.
            state.processes.insert(
                name.clone(),
                LiveProcess {
                    pid,
                    // Without a child body or a script the process
                    // trivially succeeds on the first poll.
                    state: if live {
                        ProcessState::Online
                    } else {
                        ProcessState::Stopped
                    },
                    exit_code: if live { None } else { Some(0) },
                    handle: None,
                },
            );
        }

        if let Some(child) = &self.child {
            let body = child(spec);
            let state = self.state.clone();
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                let code = body.await;
                let mut state = state.lock();
                if let Some(process) = state.processes.get_mut(&task_name) {
                    process.state = ProcessState::Stopped;
                    process.exit_code = Some(code);
                }
            });
            if let Some(process) = self.state.lock().processes.get_mut(&name) {
                process.handle = Some(handle);
            }
        }
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Option<ProcessDescription>> {
        let mut state = self.state.lock();

        if !state.started.contains(name) {
            return Ok(state.preloaded.get(name).cloned());
        }

        if let Some(queue) = state.script.get_mut(name) {
            let desc = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            return Ok(desc);
        }

        Ok(state.processes.get(name).map(|p| ProcessDescription {
            name: name.to_string(),
            pid: Some(p.pid),
            state: p.state.clone(),
            exit_code: p.exit_code,
            error_log_path: None,
        }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.deleted.push(name.to_string());
        if state.fail_delete {
            return Err(MillError::Supervisor(format!(
                "delete refused for '{name}'"
            )));
        }
        state.preloaded.remove(name);
        if let Some(mut process) = state.processes.remove(name) {
            if let Some(handle) = process.handle.take() {
                handle.abort();
            }
        }
        Ok(())
    }
}

/// Build a plain description for scripting.
pub fn description(
    name: &str,
    state: ProcessState,
    pid: Option<u32>,
    exit_code: Option<i32>,
) -> ProcessDescription {
    ProcessDescription {
        name: name.to_string(),
        pid,
        state,
        exit_code,
        error_log_path: None,
    }
}

/// Ordered primes up to and including `limit`.
pub fn primes_below(limit: u64) -> Vec<u64> {
    let mut sieve = vec![true; (limit + 1) as usize];
    let mut primes = Vec::new();
    for n in 2..=limit as usize {
        if sieve[n] {
            primes.push(n as u64);
            let mut m = n * n;
            while m <= limit as usize {
                sieve[m] = false;
                m += n;
            }
        }
    }
    primes
}

/// Worker computing the ordered primes up to `settings.limit`.
pub fn primes_worker() -> Arc<dyn Worker> {
    worker_fn(|settings: Value, ctx| async move {
        let limit = settings
            .get("limit")
            .and_then(Value::as_u64)
            .ok_or("missing limit")?;
        ctx.progress(Some("sieving"), Some(0.0), Some(100.0)).await;
        let primes = primes_below(limit);
        ctx.progress(Some("sieving"), Some(100.0), Some(100.0)).await;
        Ok(json!(primes))
    })
}

/// Worker that misbehaves on demand: `{"throw": true}` fails, and
/// `{"wait_ms": N}` stalls before succeeding.
pub fn errors_worker() -> Arc<dyn Worker> {
    worker_fn(|settings: Value, _ctx| async move {
        if settings.get("throw").and_then(Value::as_bool) == Some(true) {
            return Err("agent failed on request".to_string());
        }
        if let Some(ms) = settings.get("wait_ms").and_then(Value::as_u64) {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
        Ok(json!("ok"))
    })
}

pub fn noop_worker() -> Arc<dyn Worker> {
    worker_fn(|_, _| async { Ok(Value::Null) })
}
