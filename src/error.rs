use thiserror::Error;

#[derive(Error, Debug)]
pub enum MillError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid agent definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("No runner selectable for agent: {0}")]
    NoRunner(String),

    #[error("Unknown runner: {0}")]
    UnknownRunner(String),

    #[error("No cache selectable for agent: {0}")]
    NoCache(String),

    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    #[error("Runner '{runner}' is not among the methods of agent '{agent}'")]
    MethodNotAllowed { agent: String, runner: String },

    #[error("{0}")]
    Runner(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("Orchestrator is destroyed")]
    Destroyed,

    #[error("No session found for cache key: {0}")]
    SessionNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MillError {
    /// Short string form handed to every waiter coalesced on a failed run.
    pub fn to_cause(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, MillError>;
