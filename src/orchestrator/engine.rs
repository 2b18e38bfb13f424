use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::coalescer::{Claim, Coalescer};
use crate::agent::{AgentDefinition, AgentRegistry, AgentSource, ProgressState, StaticSource};
use crate::cache::{CacheEntryMeta, MemoryCache, SharedCache};
use crate::config::MillConfig;
use crate::error::{MillError, Result};
use crate::events::{EventEmitter, MillEvent};
use crate::runner::{EnvHook, InlineRunner, ProcNameHook, SharedRunner, SupervisedRunner};
use crate::scheduler::{CronScheduler, TickFn, describe_schedule, parse_schedule};
use crate::session::{
    CacheSelector, KeyRewrite, RunnerSelector, Session, SessionFactory, SessionOverrides,
    SessionStatus, SessionView, progress_key,
};
use crate::supervisor::SharedSupervisor;

/// One row of `list()`: the agent's registration data plus any
/// cache-resident metadata for its default key.
#[derive(Debug, Clone, Serialize)]
pub struct AgentListEntry {
    pub id: String,
    pub cache_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub methods: Vec<String>,
    pub show: bool,
    pub clear_on_build: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<CacheEntryMeta>,
}

struct Inner {
    config: MillConfig,
    emitter: EventEmitter,
    registry: Arc<AgentRegistry>,
    sources: Vec<Arc<dyn AgentSource>>,
    factory: SessionFactory,
    runners: HashMap<String, SharedRunner>,
    caches: HashMap<String, SharedCache>,
    cache_order: Vec<String>,
    coalescer: Coalescer,
    scheduler: Mutex<Option<CronScheduler>>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
}

/// The façade. Cheaply cloneable; all state is shared behind one `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: MillConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Subscribe to orchestrator events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MillEvent> {
        self.inner.emitter.subscribe()
    }

    pub fn emitter(&self) -> EventEmitter {
        self.inner.emitter.clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(MillError::Destroyed);
        }
        Ok(())
    }

    /// Construct cache backends, refresh the registry, install cron tasks
    /// for timed agents, and launch immediate agents. Fails if any cache
    /// backend fails to init.
    pub async fn init(&self) -> Result<()> {
        self.ensure_live()?;
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.emitter.emit(MillEvent::Init);

        for name in &self.inner.cache_order {
            if let Some(cache) = self.inner.caches.get(name) {
                cache.init().await?;
            }
        }

        self.refresh().await?;

        let scheduler = CronScheduler::new();
        if self.inner.config.auto_install {
            let on_tick = self.tick_fn();
            for agent in self.inner.registry.all() {
                if let Some(timing) = &agent.timing {
                    match parse_schedule(timing) {
                        Ok(schedule) => scheduler.install(
                            agent.id.clone(),
                            schedule,
                            self.inner.emitter.clone(),
                            on_tick.clone(),
                        ),
                        Err(e) => {
                            warn!(agent = %agent.id, error = %e, "Skipping unschedulable agent")
                        }
                    }
                }
            }
        }
        *self.inner.scheduler.lock() = Some(scheduler);

        if self.inner.config.allow_immediate {
            for agent in self.inner.registry.all() {
                if agent.immediate {
                    self.inner.emitter.emit(MillEvent::RunImmediate {
                        agent_id: agent.id.clone(),
                    });
                    let this = self.clone();
                    let id = agent.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.run(&id, None).await {
                            warn!(agent = %id, error = %e, "Immediate run failed");
                        }
                    });
                }
            }
        }

        info!(agents = self.inner.registry.len(), "Orchestrator ready");
        self.inner.emitter.emit(MillEvent::Ready);
        Ok(())
    }

    /// Cooperative stop: scheduler ticks cease, backends and runners
    /// release resources, in-flight sessions terminate naturally.
    /// Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.emitter.emit(MillEvent::Destroy);

        if let Some(scheduler) = self.inner.scheduler.lock().take() {
            scheduler.pause();
        }

        for name in &self.inner.cache_order {
            if let Some(cache) = self.inner.caches.get(name) {
                if let Err(e) = cache.destroy().await {
                    warn!(cache = %name, error = %e, "Cache destroy failed");
                }
            }
        }

        for runner in self.inner.runners.values() {
            runner.destroy().await;
        }

        self.inner.emitter.emit(MillEvent::Destroyed);
    }

    /// Re-enumerate agent sources and rebuild the registry. Duplicate ids
    /// and malformed definitions are warned about, never fatal. Returns
    /// the sorted id list.
    pub async fn refresh(&self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        for source in &self.inner.sources {
            let origin = source.origin().to_string();
            for draft in source.load().await {
                entries.push((origin.clone(), draft));
            }
        }

        let emitter = self.inner.emitter.clone();
        let ids = self.inner.registry.rebuild(
            entries,
            &self.inner.config.agent_defaults,
            |origin, msg| {
                emitter.emit(MillEvent::RefreshWarn {
                    origin: origin.to_string(),
                    message: msg.to_string(),
                });
            },
        );

        debug!(count = ids.len(), "Registry refreshed");
        self.inner.emitter.emit(MillEvent::Refresh { ids: ids.clone() });
        Ok(ids)
    }

    /// Pure lookup.
    pub fn has(&self, id: &str) -> bool {
        self.inner.registry.has(id)
    }

    /// The cache key `(id, settings)` resolves to, rewrite hook included.
    pub fn derive_key(&self, id: &str, settings: Option<&Value>) -> String {
        self.inner
            .factory
            .derive_key(id, settings.unwrap_or(&Value::Null))
    }

    /// Cached value for the derived key, or run the agent and return the
    /// eventual value.
    pub async fn get(&self, id: &str, settings: Option<Value>) -> Result<Value> {
        self.ensure_live()?;
        let session = self
            .inner
            .factory
            .create_session(id, settings, &SessionOverrides::default())?;
        if let Some(value) = session.backend.get(&session.cache_key).await? {
            return Ok(value);
        }
        self.wait_for(self.launch(session)?).await
    }

    /// Like `get`, but a miss returns `None` instead of triggering a run.
    pub async fn get_lazy(&self, id: &str, settings: Option<Value>) -> Result<Option<Value>> {
        self.ensure_live()?;
        let session = self
            .inner
            .factory
            .create_session(id, settings, &SessionOverrides::default())?;
        session.backend.get(&session.cache_key).await
    }

    /// Byte size of the cached value for the derived key, without
    /// triggering a run.
    pub async fn get_size(&self, id: &str, settings: Option<Value>) -> Result<Option<u64>> {
        self.ensure_live()?;
        let session = self
            .inner
            .factory
            .create_session(id, settings, &SessionOverrides::default())?;
        session.backend.size(&session.cache_key).await
    }

    /// Force execution and return the eventual value.
    pub async fn run(&self, id: &str, settings: Option<Value>) -> Result<Value> {
        self.run_with(id, settings, SessionOverrides::default()).await
    }

    pub async fn run_with(
        &self,
        id: &str,
        settings: Option<Value>,
        overrides: SessionOverrides,
    ) -> Result<Value> {
        self.ensure_live()?;
        let session = self.inner.factory.create_session(id, settings, &overrides)?;
        self.wait_for(self.launch(session)?).await
    }

    /// Force execution and return the session object; poll `status()` or
    /// await `wait()` for the outcome.
    pub async fn run_session(&self, id: &str, settings: Option<Value>) -> Result<Arc<Session>> {
        self.run_session_with(id, settings, SessionOverrides::default())
            .await
    }

    pub async fn run_session_with(
        &self,
        id: &str,
        settings: Option<Value>,
        overrides: SessionOverrides,
    ) -> Result<Arc<Session>> {
        self.ensure_live()?;
        let session = self.inner.factory.create_session(id, settings, &overrides)?;
        self.launch(session)
    }

    /// Remove the cached value for the derived key. An in-flight run is
    /// not cancelled; its eventual write repopulates the cache.
    pub async fn invalidate(&self, id: &str, settings: Option<Value>) -> Result<()> {
        let session = self
            .inner
            .factory
            .create_session(id, settings, &SessionOverrides::default())?;
        session.backend.unset(&session.cache_key).await
    }

    pub async fn invalidate_session(&self, session: &Session) -> Result<()> {
        session.backend.unset(&session.cache_key).await
    }

    /// Inspect the cache for the result and progress records and infer the
    /// session status. When only the key is known every registered backend
    /// is scanned in parallel and the first one reporting data wins.
    pub async fn get_session(&self, cache_key: &str) -> Result<SessionView> {
        if let Some(session) = self.inner.coalescer.get(cache_key) {
            return Ok(session.view());
        }

        let pkey = progress_key(cache_key);
        let probes = self.inner.cache_order.iter().filter_map(|name| {
            let backend = self.inner.caches.get(name).cloned()?;
            let key = cache_key.to_string();
            let pkey = pkey.clone();
            Some(async move {
                let value = backend.get(&key).await.ok().flatten();
                let progress = backend.get(&pkey).await.ok().flatten();
                (value, progress)
            })
        });

        let (value, progress) = join_all(probes)
            .await
            .into_iter()
            .find(|(v, p)| v.is_some() || p.is_some())
            .unwrap_or((None, None));

        let progress = progress.map(|record| ProgressState {
            text: record
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
            current: record.get("current").and_then(Value::as_f64),
            max: None,
            percent: record
                .get("current")
                .and_then(Value::as_u64)
                .map(|p| p as u32),
        });

        Ok(match value {
            Some(value) => match error_envelope(&value) {
                Some(error) => SessionView {
                    cache_key: cache_key.to_string(),
                    status: SessionStatus::Error,
                    result: None,
                    error: Some(error),
                    progress,
                },
                None => SessionView {
                    cache_key: cache_key.to_string(),
                    status: SessionStatus::Complete,
                    result: Some(value),
                    error: None,
                    progress,
                },
            },
            // Nothing cached and nothing running: the caller asserted a
            // session existed, so absence is an error.
            None => SessionView {
                cache_key: cache_key.to_string(),
                status: SessionStatus::Error,
                result: None,
                error: Some("No session data found".to_string()),
                progress,
            },
        })
    }

    /// One record per registered agent.
    pub async fn list(&self) -> Result<Vec<AgentListEntry>> {
        let mut entries = Vec::new();
        for agent in self.inner.registry.all() {
            let cache_key = self.inner.factory.derive_key(&agent.id, &Value::Null);
            let meta = self.find_meta(&cache_key).await;
            entries.push(AgentListEntry {
                id: agent.id.clone(),
                cache_key,
                timing: agent.timing.clone(),
                timing_text: agent.timing.as_deref().map(describe_schedule),
                expires: agent.expires.clone(),
                methods: agent.methods.clone(),
                show: agent.show,
                clear_on_build: agent.clear_on_build,
                meta,
            });
        }
        Ok(entries)
    }

    async fn find_meta(&self, cache_key: &str) -> Option<CacheEntryMeta> {
        for name in &self.inner.cache_order {
            let backend = self.inner.caches.get(name)?;
            match backend.list().await {
                Ok(metas) => {
                    if let Some(meta) = metas.into_iter().find(|m| m.id == cache_key) {
                        return Some(meta);
                    }
                }
                Err(e) => warn!(cache = %name, error = %e, "Cache list failed"),
            }
        }
        None
    }

    /// Register the session in the coalescer and schedule its execution.
    /// Joins an already in-flight session for the same key instead of
    /// starting another worker.
    fn launch(&self, session: Arc<Session>) -> Result<Arc<Session>> {
        if !session.agent.methods.iter().any(|m| *m == session.runner) {
            return Err(MillError::MethodNotAllowed {
                agent: session.agent_id.clone(),
                runner: session.runner.clone(),
            });
        }

        match self.inner.coalescer.claim(&session) {
            Claim::Joined(existing) => Ok(existing),
            Claim::Claimed => {
                self.inner.emitter.emit(MillEvent::Run {
                    agent_id: session.agent_id.clone(),
                    cache_key: session.cache_key.clone(),
                });
                let this = self.clone();
                let owned = session.clone();
                // Execution happens on a spawned task so the caller
                // receives the session synchronously.
                tokio::spawn(async move { this.execute(owned).await });
                Ok(session)
            }
        }
    }

    async fn execute(&self, session: Arc<Session>) {
        let pkey = progress_key(&session.cache_key);
        if let Err(e) = session.backend.unset(&pkey).await {
            warn!(cache_key = %session.cache_key, error = %e, "Failed to clear progress record");
        }

        let outcome = match self.inner.runners.get(&session.runner) {
            Some(runner) => runner.exec(&session).await,
            None => Err(MillError::UnknownRunner(session.runner.clone())),
        };

        match outcome {
            Ok(value) => session.complete(value.unwrap_or(Value::Null)),
            Err(e) => {
                let cause = e.to_cause();
                debug!(agent = %session.agent_id, cache_key = %session.cache_key, %cause, "Run failed");
                session.fail(cause);
            }
        }

        self.inner.coalescer.remove(&session.cache_key);
    }

    async fn wait_for(&self, session: Arc<Session>) -> Result<Value> {
        session.wait().await.map_err(MillError::Runner)
    }

    fn tick_fn(&self) -> TickFn {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |agent_id: &str| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let orchestrator = Orchestrator { inner };
            let id = agent_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(&id, None).await {
                    warn!(agent = %id, error = %e, "Scheduled run failed");
                }
            });
        })
    }
}

/// `{"error": ...}` and nothing else is the persisted failure envelope.
fn error_envelope(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("error").map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        _ => None,
    }
}

pub struct OrchestratorBuilder {
    config: MillConfig,
    caches: Vec<SharedCache>,
    runners: Vec<SharedRunner>,
    supervisor: Option<SharedSupervisor>,
    sources: Vec<Arc<dyn AgentSource>>,
    definitions: Vec<AgentDefinition>,
    key_rewrite: KeyRewrite,
    runner_selector: Option<RunnerSelector>,
    cache_selector: Option<CacheSelector>,
    proc_name: Option<ProcNameHook>,
    env_hook: Option<EnvHook>,
}

impl OrchestratorBuilder {
    fn new(config: MillConfig) -> Self {
        Self {
            config,
            caches: Vec::new(),
            runners: Vec::new(),
            supervisor: None,
            sources: Vec::new(),
            definitions: Vec::new(),
            key_rewrite: Arc::new(|key| key),
            runner_selector: None,
            cache_selector: None,
            proc_name: None,
            env_hook: None,
        }
    }

    /// Register a cache backend. The first registered backend is the
    /// default selection. Without any, an in-memory backend is used.
    pub fn cache(mut self, backend: SharedCache) -> Self {
        self.caches.push(backend);
        self
    }

    /// Register an additional runner beyond the built-in inline runner.
    pub fn runner(mut self, runner: SharedRunner) -> Self {
        self.runners.push(runner);
        self
    }

    /// Enable the supervised runner backed by this supervisor.
    pub fn supervisor(mut self, supervisor: SharedSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Register an agent source consulted by refresh().
    pub fn source(mut self, source: Arc<dyn AgentSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Register a single agent definition directly.
    pub fn agent(mut self, definition: AgentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Final mangler applied to every derived cache key.
    pub fn key_rewrite(mut self, hook: KeyRewrite) -> Self {
        self.key_rewrite = hook;
        self
    }

    pub fn runner_selector(mut self, hook: RunnerSelector) -> Self {
        self.runner_selector = Some(hook);
        self
    }

    pub fn cache_selector(mut self, hook: CacheSelector) -> Self {
        self.cache_selector = Some(hook);
        self
    }

    /// Supervisor process-name derivation for the supervised runner.
    pub fn proc_name(mut self, hook: ProcNameHook) -> Self {
        self.proc_name = Some(hook);
        self
    }

    /// Extra environment for supervised child processes.
    pub fn env_hook(mut self, hook: EnvHook) -> Self {
        self.env_hook = Some(hook);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let emitter = EventEmitter::new();
        let registry = Arc::new(AgentRegistry::new());

        let mut caches: HashMap<String, SharedCache> = HashMap::new();
        let mut cache_order = Vec::new();
        let registered: Vec<SharedCache> = if self.caches.is_empty() {
            vec![Arc::new(MemoryCache::default())]
        } else {
            self.caches
        };
        for backend in registered {
            let name = backend.name().to_string();
            if !config.cache.is_enabled(&name) {
                continue;
            }
            if caches.insert(name.clone(), backend).is_none() {
                cache_order.push(name);
            }
        }
        if caches.is_empty() {
            return Err(MillError::NoCache("<init>".into()));
        }

        let mut runners: HashMap<String, SharedRunner> = HashMap::new();
        let mut runner_order = Vec::new();
        let mut registered: Vec<SharedRunner> = vec![Arc::new(InlineRunner::new())];
        if let Some(supervisor) = self.supervisor {
            let mut supervised = SupervisedRunner::new(
                supervisor,
                config.runner.supervised.clone(),
                config.check_process_ms,
            );
            if let Some(hook) = self.proc_name {
                supervised = supervised.with_proc_name(hook);
            }
            if let Some(hook) = self.env_hook {
                supervised = supervised.with_env_hook(hook);
            }
            registered.push(Arc::new(supervised));
        }
        registered.extend(self.runners);
        for runner in registered {
            let name = runner.name().to_string();
            if !config.runner.is_enabled(&name) {
                continue;
            }
            if runners.insert(name.clone(), runner).is_none() {
                runner_order.push(name);
            }
        }
        if runners.is_empty() {
            return Err(MillError::NoRunner("<init>".into()));
        }

        let mut sources = self.sources;
        if !self.definitions.is_empty() {
            sources.push(Arc::new(StaticSource::from_definitions(
                "registered",
                &self.definitions,
            )));
        }

        let factory = SessionFactory::new(
            registry.clone(),
            runner_order.clone(),
            caches.clone(),
            cache_order.clone(),
            self.key_rewrite,
            self.runner_selector
                .unwrap_or_else(SessionFactory::default_runner_selector),
            self.cache_selector
                .unwrap_or_else(SessionFactory::default_cache_selector),
            emitter.clone(),
            config.log_throttle_ms,
        );

        let auto_init = config.auto_init;
        let orchestrator = Orchestrator {
            inner: Arc::new(Inner {
                config,
                emitter,
                registry,
                sources,
                factory,
                runners,
                caches,
                cache_order,
                coalescer: Coalescer::new(),
                scheduler: Mutex::new(None),
                initialized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        };

        if auto_init {
            orchestrator.init().await?;
        }
        Ok(orchestrator)
    }
}
