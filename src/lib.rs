pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod testutil;

pub use agent::{
    AgentDefinition, AgentRegistry, AgentSource, DefinitionDraft, ProgressState, StaticSource,
    Worker, WorkerContext, worker_fn,
};
pub use cache::{CacheBackend, CacheEntryMeta, MemoryCache, SharedCache};
pub use config::{AgentDefaults, CacheConfig, MillConfig, RunnerConfig, SupervisedConfig};
pub use error::{MillError, Result};
pub use events::{EventEmitter, MillEvent};
pub use orchestrator::{AgentListEntry, Orchestrator, OrchestratorBuilder};
pub use runner::{InlineRunner, Runner, SharedRunner, SupervisedRunner};
pub use scheduler::{CronScheduler, describe_schedule, parse_schedule};
pub use session::{
    Defer, Outcome, Session, SessionOverrides, SessionStatus, SessionView, derive_key,
    progress_key,
};
pub use supervisor::{
    ProcessDescription, ProcessSpec, ProcessState, SharedSupervisor, Supervisor,
};
