//! Orchestration façade.
//!
//! Composes the registry, caches, runners, coalescer and scheduler behind
//! the public operations:
//! - `Orchestrator`: get/run/invalidate/list/getSession/has/init/destroy
//! - `OrchestratorBuilder`: registration of backends, runners and hooks
//! - `Coalescer`: one in-flight execution per cache key

mod coalescer;
mod engine;

pub use coalescer::{Claim, Coalescer};
pub use engine::{AgentListEntry, Orchestrator, OrchestratorBuilder};
