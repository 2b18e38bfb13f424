//! Per-run capability object passed to worker bodies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::cache::SharedCache;
use crate::events::{EventEmitter, MillEvent};
use crate::session::progress_key;

/// Progress records in the cache live this long; staleness detection
/// relies on the value.
const PROGRESS_TTL: Duration = Duration::from_secs(30 * 60);

/// Leading-edge throttle: the first call in a window passes, the rest of
/// the window is silent.
pub struct Throttle {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn allow(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// In-memory progress view for session pollers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressState {
    pub text: Option<String>,
    pub current: Option<f64>,
    pub max: Option<f64>,
    pub percent: Option<u32>,
}

struct ContextInner {
    agent_id: String,
    cache_key: String,
    backend: SharedCache,
    emitter: EventEmitter,
    log_throttle: Throttle,
    progress_throttle: Throttle,
    progress: RwLock<Option<ProgressState>>,
}

/// Capabilities handed to a worker body. Explicitly passed (never ambient)
/// so test harnesses can substitute the backend and observe the events.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

impl WorkerContext {
    pub fn new(
        agent_id: impl Into<String>,
        cache_key: impl Into<String>,
        backend: SharedCache,
        emitter: EventEmitter,
        log_throttle_ms: u64,
    ) -> Self {
        let window = Duration::from_millis(log_throttle_ms);
        Self {
            inner: Arc::new(ContextInner {
                agent_id: agent_id.into(),
                cache_key: cache_key.into(),
                backend,
                emitter,
                log_throttle: Throttle::new(window),
                progress_throttle: Throttle::new(window),
                progress: RwLock::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn cache_key(&self) -> &str {
        &self.inner.cache_key
    }

    /// Current in-memory progress, if the worker reported any.
    pub fn progress_state(&self) -> Option<ProgressState> {
        self.inner.progress.read().clone()
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(agent = %self.inner.agent_id, cache_key = %self.inner.cache_key, "{message}");
        self.inner.emitter.emit(MillEvent::Log {
            cache_key: self.inner.cache_key.clone(),
            message,
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(agent = %self.inner.agent_id, cache_key = %self.inner.cache_key, "{message}");
        self.inner.emitter.emit(MillEvent::Warn {
            cache_key: self.inner.cache_key.clone(),
            message,
        });
    }

    /// Leading-edge throttled log.
    pub fn log_throttled(&self, message: impl Into<String>) {
        if self.inner.log_throttle.allow() {
            self.log(message);
        }
    }

    /// Report progress. Three effective shapes:
    /// - text only: resets progress and logs the text
    /// - `max == 100`: `current` is already a percentage
    /// - `current`/`max`: ratio with a computed percentage
    /// - `current` only: bare counter
    ///
    /// A `{text, current}` record is written (throttled) under
    /// `"<cacheKey>-progress"` with a 30-minute TTL.
    pub async fn progress(&self, text: Option<&str>, current: Option<f64>, max: Option<f64>) {
        let label = text.unwrap_or("Progress");

        let (line, percent) = match (current, max) {
            (None, _) => {
                *self.inner.progress.write() = Some(ProgressState {
                    text: text.map(str::to_string),
                    ..Default::default()
                });
                if let Some(text) = text {
                    self.log_throttled(text);
                }
                return;
            }
            (Some(current), Some(max)) if max == 100.0 => {
                let percent = current.floor().max(0.0) as u32;
                (format!("{}: {}%", label, percent), Some(percent))
            }
            (Some(current), Some(max)) => {
                let percent = (current / max * 100.0).ceil().max(0.0) as u32;
                (
                    format!(
                        "{}: {} / {} ({}%)",
                        label,
                        fmt_num(current),
                        fmt_num(max),
                        percent
                    ),
                    Some(percent),
                )
            }
            (Some(current), None) => (format!("{}: {}", label, fmt_num(current)), None),
        };

        self.log_throttled(line.as_str());

        *self.inner.progress.write() = Some(ProgressState {
            text: text.map(str::to_string),
            current,
            max,
            percent,
        });

        if let Some(percent) = percent {
            if self.inner.progress_throttle.allow() {
                let key = progress_key(&self.inner.cache_key);
                let record = json!({ "text": label, "current": percent });
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(PROGRESS_TTL).unwrap_or(chrono::Duration::zero());
                if let Err(e) = self.inner.backend.set(&key, record, Some(expires_at)).await {
                    warn!(error = %e, cache_key = %self.inner.cache_key, "Failed to write progress record");
                }
            }
        }
    }
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
