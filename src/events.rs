//! Orchestrator event stream.
//!
//! Every externally observable transition is published through a broadcast
//! channel so listeners (dashboards, test harnesses) can attribute output
//! to a specific agent or run without polling.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MillEvent {
    Init,
    Ready,
    Destroy,
    Destroyed,
    Refresh {
        ids: Vec<String>,
    },
    RefreshWarn {
        origin: String,
        message: String,
    },
    Scheduled {
        agent_id: String,
    },
    Tick {
        agent_id: String,
    },
    RunImmediate {
        agent_id: String,
    },
    Run {
        agent_id: String,
        cache_key: String,
    },
    Log {
        cache_key: String,
        message: String,
    },
    Warn {
        cache_key: String,
        message: String,
    },
}

impl MillEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Destroy => "destroy",
            Self::Destroyed => "destroyed",
            Self::Refresh { .. } => "refresh",
            Self::RefreshWarn { .. } => "refresh.warn",
            Self::Scheduled { .. } => "scheduled",
            Self::Tick { .. } => "tick",
            Self::RunImmediate { .. } => "run.immediate",
            Self::Run { .. } => "run",
            Self::Log { .. } => "log",
            Self::Warn { .. } => "warn",
        }
    }
}

/// Non-blocking event fan-out.
///
/// `emit` never awaits; slow receivers lag and drop rather than blocking
/// the orchestrator.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<MillEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Returns the receiver count.
    pub fn emit(&self, event: MillEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MillEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
