//! Sessions: one record per live request.
//!
//! Provides session construction and identity:
//! - `Session`: the per-request record the orchestrator owns
//! - `Defer`: one-shot resolution every coalesced waiter attaches to
//! - `SessionFactory`: normalizes an (id, settings) request into a session
//! - `derive_key`: deterministic cache-key derivation

mod key;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

pub use key::{derive_key, progress_key, stable_stringify};

use crate::agent::{AgentDefinition, AgentRegistry, ProgressState, WorkerContext};
use crate::cache::SharedCache;
use crate::error::{MillError, Result};
use crate::events::EventEmitter;

/// What a run resolved to: the value, or a short stringified cause.
pub type Outcome = std::result::Result<Value, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Complete,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// One-shot promise-like resolver. Resolved exactly once; late waiters
/// observe the already-resolved outcome.
#[derive(Clone)]
pub struct Defer {
    tx: Arc<watch::Sender<Option<Outcome>>>,
}

impl Defer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve the defer. Returns false when already resolved.
    pub fn resolve(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> Outcome {
        let mut rx = self.tx.subscribe();
        loop {
            let resolved = rx.borrow_and_update().clone();
            if let Some(outcome) = resolved {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err("session dropped before resolution".to_string());
            }
        }
    }
}

impl Default for Defer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request record. Owned by the orchestrator while registered in the
/// coalescer; workers receive only the borrowed context.
pub struct Session {
    pub agent_id: String,
    pub settings: Value,
    pub cache_key: String,
    /// Resolved runner name.
    pub runner: String,
    /// Resolved cache name.
    pub cache: String,
    pub start_time: DateTime<Utc>,
    pub agent: Arc<AgentDefinition>,
    pub backend: SharedCache,
    pub context: WorkerContext,
    pub defer: Defer,
    status: RwLock<SessionStatus>,
    result: RwLock<Option<Value>>,
    error: RwLock<Option<String>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn result(&self) -> Option<Value> {
        self.result.read().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn progress(&self) -> Option<ProgressState> {
        self.context.progress_state()
    }

    /// Await the defer; the value on success, the short cause on failure.
    pub async fn wait(&self) -> Outcome {
        self.defer.wait().await
    }

    pub(crate) fn complete(&self, value: Value) {
        *self.status.write() = SessionStatus::Complete;
        *self.result.write() = Some(value.clone());
        self.defer.resolve(Ok(value));
    }

    pub(crate) fn fail(&self, cause: String) {
        *self.status.write() = SessionStatus::Error;
        *self.error.write() = Some(cause.clone());
        self.defer.resolve(Err(cause));
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            cache_key: self.cache_key.clone(),
            status: self.status(),
            result: self.result(),
            error: self.error(),
            progress: self.progress(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("agent_id", &self.agent_id)
            .field("cache_key", &self.cache_key)
            .field("runner", &self.runner)
            .field("cache", &self.cache)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Detached, serializable snapshot of a session (also what `getSession`
/// reconstructs from the cache when only the key is known).
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub cache_key: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressState>,
}

/// Final mangler applied to every derived cache key.
pub type KeyRewrite = Arc<dyn Fn(String) -> String + Send + Sync>;
/// Picks a runner name from the enabled set for an agent.
pub type RunnerSelector = Arc<dyn Fn(&AgentDefinition, &[String]) -> Option<String> + Send + Sync>;
/// Picks a cache name from the enabled set for an agent.
pub type CacheSelector = Arc<dyn Fn(&AgentDefinition, &[String]) -> Option<String> + Send + Sync>;

/// Per-request overrides accepted by run/get.
#[derive(Default, Clone)]
pub struct SessionOverrides {
    pub cache_key: Option<String>,
    pub runner: Option<String>,
    pub cache: Option<String>,
}

/// Normalizes an (id, params) request into a session record with resolved
/// runner, cache and cache key.
pub struct SessionFactory {
    registry: Arc<AgentRegistry>,
    runner_names: Vec<String>,
    caches: HashMap<String, SharedCache>,
    cache_names: Vec<String>,
    key_rewrite: KeyRewrite,
    runner_selector: RunnerSelector,
    cache_selector: CacheSelector,
    emitter: EventEmitter,
    log_throttle_ms: u64,
}

impl SessionFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        runner_names: Vec<String>,
        caches: HashMap<String, SharedCache>,
        cache_names: Vec<String>,
        key_rewrite: KeyRewrite,
        runner_selector: RunnerSelector,
        cache_selector: CacheSelector,
        emitter: EventEmitter,
        log_throttle_ms: u64,
    ) -> Self {
        Self {
            registry,
            runner_names,
            caches,
            cache_names,
            key_rewrite,
            runner_selector,
            cache_selector,
            emitter,
            log_throttle_ms,
        }
    }

    /// Default runner selection: first of the agent's methods that names
    /// an enabled runner.
    pub fn default_runner_selector() -> RunnerSelector {
        Arc::new(|agent, enabled| {
            agent
                .methods
                .iter()
                .find(|m| enabled.iter().any(|r| r == *m))
                .cloned()
        })
    }

    /// Default cache selection: the first enabled backend.
    pub fn default_cache_selector() -> CacheSelector {
        Arc::new(|_, enabled| enabled.first().cloned())
    }

    /// Derived cache key for `(id, settings)` after the rewrite hook.
    pub fn derive_key(&self, id: &str, settings: &Value) -> String {
        (self.key_rewrite)(derive_key(id, settings))
    }

    pub fn create_session(
        &self,
        agent_id: &str,
        settings: Option<Value>,
        overrides: &SessionOverrides,
    ) -> Result<Arc<Session>> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| MillError::AgentNotFound(agent_id.to_string()))?;

        let settings = settings.unwrap_or(Value::Null);
        let cache_key = overrides
            .cache_key
            .clone()
            .unwrap_or_else(|| self.derive_key(agent_id, &settings));

        let runner = match &overrides.runner {
            Some(name) => name.clone(),
            None => (self.runner_selector)(&agent, &self.runner_names)
                .ok_or_else(|| MillError::NoRunner(agent_id.to_string()))?,
        };
        if !self.runner_names.iter().any(|r| *r == runner) {
            return Err(MillError::UnknownRunner(runner));
        }

        let cache = match &overrides.cache {
            Some(name) => name.clone(),
            None => (self.cache_selector)(&agent, &self.cache_names)
                .ok_or_else(|| MillError::NoCache(agent_id.to_string()))?,
        };
        let backend = self
            .caches
            .get(&cache)
            .cloned()
            .ok_or_else(|| MillError::UnknownCache(cache.clone()))?;

        let context = WorkerContext::new(
            agent_id,
            cache_key.clone(),
            backend.clone(),
            self.emitter.clone(),
            self.log_throttle_ms,
        );

        Ok(Arc::new(Session {
            agent_id: agent_id.to_string(),
            settings,
            cache_key,
            runner,
            cache,
            start_time: Utc::now(),
            agent,
            backend,
            context,
            defer: Defer::new(),
            status: RwLock::new(SessionStatus::Pending),
            result: RwLock::new(None),
            error: RwLock::new(None),
        }))
    }
}
