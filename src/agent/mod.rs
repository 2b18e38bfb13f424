//! Agent definitions and the worker contract.
//!
//! Provides the registry catalog and the per-run capability object:
//! - `AgentDefinition`: immutable description of a named computation
//! - `Worker`, `worker_fn`: the computation itself
//! - `AgentSource`, `StaticSource`: where refresh() enumerates definitions
//! - `WorkerContext`: log/warn/progress capabilities handed to workers

mod context;
mod registry;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use context::{ProgressState, Throttle, WorkerContext};
pub use registry::AgentRegistry;

use crate::config::AgentDefaults;
use crate::error::{MillError, Result};

/// A worker body: the computation an agent names.
///
/// Failures are reported as short human-readable causes; the orchestrator
/// never retries and never inspects the cause beyond propagating it.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, settings: Value, ctx: WorkerContext) -> std::result::Result<Value, String>;
}

struct FnWorker<F>(F);

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(Value, WorkerContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, String>> + Send,
{
    async fn run(&self, settings: Value, ctx: WorkerContext) -> std::result::Result<Value, String> {
        (self.0)(settings, ctx).await
    }
}

/// Wrap an async closure as a shared worker.
pub fn worker_fn<F, Fut>(f: F) -> Arc<dyn Worker>
where
    F: Fn(Value, WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    Arc::new(FnWorker(f))
}

/// Immutable after registration.
#[derive(Clone)]
pub struct AgentDefinition {
    pub id: String,
    pub worker: Arc<dyn Worker>,
    /// Cron expression; timed agents re-run themselves on this schedule.
    pub timing: Option<String>,
    /// Duration string such as `"1h"`; cached results carry this TTL.
    pub expires: Option<String>,
    /// When false, the runner must not write a cache value on success.
    pub has_return: bool,
    /// Run once at initialization when immediate execution is permitted.
    pub immediate: bool,
    /// Ordered runner names this agent is compatible with; first match
    /// with an enabled runner wins.
    pub methods: Vec<String>,
    pub show: bool,
    pub clear_on_build: bool,
}

impl fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("id", &self.id)
            .field("timing", &self.timing)
            .field("expires", &self.expires)
            .field("has_return", &self.has_return)
            .field("immediate", &self.immediate)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            worker,
            timing: None,
            expires: None,
            has_return: true,
            immediate: false,
            methods: vec!["inline".into()],
            show: true,
            clear_on_build: false,
        }
    }

    pub fn with_timing(mut self, expr: impl Into<String>) -> Self {
        self.timing = Some(expr.into());
        self
    }

    pub fn with_expires(mut self, expires: impl Into<String>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    pub fn without_return(mut self) -> Self {
        self.has_return = false;
        self
    }

    pub fn with_immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.show = false;
        self
    }

    pub fn with_clear_on_build(mut self) -> Self {
        self.clear_on_build = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(MillError::InvalidDefinition {
                id: "<unnamed>".into(),
                reason: "id is required".into(),
            });
        }
        if let Some(expires) = &self.expires {
            let parsed = self.expires_duration()?;
            if parsed.is_none_or(|d| d.is_zero()) {
                return Err(MillError::InvalidDefinition {
                    id: self.id.clone(),
                    reason: format!("expires '{}' is not a positive duration", expires),
                });
            }
        }
        if let Some(timing) = &self.timing {
            crate::scheduler::parse_schedule(timing).map_err(|e| MillError::InvalidDefinition {
                id: self.id.clone(),
                reason: e.to_cause(),
            })?;
            if self.methods.is_empty() {
                return Err(MillError::InvalidDefinition {
                    id: self.id.clone(),
                    reason: "timed agents must declare at least one method".into(),
                });
            }
        }
        Ok(())
    }

    /// Parsed `expires`, or `None` when the agent caches indefinitely.
    pub fn expires_duration(&self) -> Result<Option<std::time::Duration>> {
        match &self.expires {
            None => Ok(None),
            Some(expires) => humantime::parse_duration(expires).map(Some).map_err(|e| {
                MillError::InvalidDefinition {
                    id: self.id.clone(),
                    reason: format!("expires '{}': {}", expires, e),
                }
            }),
        }
    }
}

/// A candidate definition as enumerated by a source. Optional fields model
/// malformed definitions: refresh() warns and skips rather than failing.
#[derive(Clone, Default)]
pub struct DefinitionDraft {
    pub id: Option<String>,
    pub worker: Option<Arc<dyn Worker>>,
    pub has_return: Option<bool>,
    pub timing: Option<String>,
    pub expires: Option<String>,
    pub immediate: bool,
    pub methods: Vec<String>,
    pub show: Option<bool>,
    pub clear_on_build: Option<bool>,
}

impl DefinitionDraft {
    pub fn from_definition(def: &AgentDefinition) -> Self {
        Self {
            id: Some(def.id.clone()),
            worker: Some(def.worker.clone()),
            has_return: Some(def.has_return),
            timing: def.timing.clone(),
            expires: def.expires.clone(),
            immediate: def.immediate,
            methods: def.methods.clone(),
            show: Some(def.show),
            clear_on_build: Some(def.clear_on_build),
        }
    }

    /// Merge defaults and validate into a registrable definition.
    pub fn finish(self, defaults: &AgentDefaults) -> std::result::Result<AgentDefinition, String> {
        let id = self.id.ok_or("definition is missing an id")?;
        let worker = self.worker.ok_or("definition is missing a worker")?;
        let has_return = self.has_return.ok_or("definition is missing hasReturn")?;

        let methods = if self.methods.is_empty() {
            defaults.methods.clone()
        } else {
            self.methods
        };

        let def = AgentDefinition {
            id,
            worker,
            timing: self.timing,
            expires: self.expires.or_else(|| defaults.expires.clone()),
            has_return,
            immediate: self.immediate,
            methods,
            show: self.show.or(defaults.show).unwrap_or(true),
            clear_on_build: self
                .clear_on_build
                .or(defaults.clear_on_build)
                .unwrap_or(false),
        };
        def.validate().map_err(|e| e.to_cause())?;
        Ok(def)
    }
}

/// Where refresh() enumerates agent definitions. Filesystem discovery is
/// an external collaborator implementing this seam.
#[async_trait]
pub trait AgentSource: Send + Sync {
    /// Label used in refresh warnings.
    fn origin(&self) -> &str;

    async fn load(&self) -> Vec<DefinitionDraft>;
}

/// A fixed in-memory source.
pub struct StaticSource {
    origin: String,
    drafts: Vec<DefinitionDraft>,
}

impl StaticSource {
    pub fn new(origin: impl Into<String>, drafts: Vec<DefinitionDraft>) -> Self {
        Self {
            origin: origin.into(),
            drafts,
        }
    }

    pub fn from_definitions(origin: impl Into<String>, defs: &[AgentDefinition]) -> Self {
        Self::new(
            origin,
            defs.iter().map(DefinitionDraft::from_definition).collect(),
        )
    }
}

#[async_trait]
impl AgentSource for StaticSource {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn load(&self) -> Vec<DefinitionDraft> {
        self.drafts.clone()
    }
}
