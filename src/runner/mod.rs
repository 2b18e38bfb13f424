//! Runners: strategies for executing one session.
//!
//! A runner executes the session's worker, writes the result into the
//! session's cache, and returns the value. Two strategies ship here:
//! - `InlineRunner`: invokes the worker in the current process
//! - `SupervisedRunner`: spawns the worker as a child under an external
//!   supervisor and harvests the result from the shared cache

mod inline;
mod postmortem;
mod supervised;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use inline::InlineRunner;
pub use postmortem::{LogEvent, analyze_log_tail, decide, parse_line};
pub use supervised::{
    ENV_AGENT_ID, ENV_CACHE, ENV_EXEC_FLAG, ENV_SETTINGS, EnvHook, ProcNameHook, SupervisedRunner,
};

use crate::error::Result;
use crate::session::Session;

/// Executes one session. On success the returned value is `Some` for
/// agents with a return and `None` otherwise; on failure the error is the
/// short cause every coalesced waiter observes.
#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    async fn exec(&self, session: &Session) -> Result<Option<Value>>;

    /// Release resources on orchestrator destroy.
    async fn destroy(&self) {}
}

pub type SharedRunner = Arc<dyn Runner>;
