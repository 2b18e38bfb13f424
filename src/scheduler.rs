//! Cron scheduler for timed agents.
//!
//! One spawned task per timed agent. Each firing emits `tick` and hands
//! the agent id to a fire-and-forget callback; a failed firing never
//! stops the task. `pause` is cooperative via a shared watch channel.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{MillError, Result};
use crate::events::{EventEmitter, MillEvent};

/// Fired on every schedule hit; implementations must not block.
pub type TickFn = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

/// Parse a standard five- or six-field cron expression. Five-field
/// expressions gain a `0` seconds field.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| MillError::Schedule(format!("{expr}: {e}")))
}

/// Best-effort human-readable translation for listings. Falls back to the
/// expression itself.
pub fn describe_schedule(expr: &str) -> String {
    let trimmed = expr.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let padded: Vec<&str> = if fields.len() == 5 {
        let mut v = vec!["0"];
        v.extend(&fields);
        v
    } else {
        fields.clone()
    };
    if padded.len() < 6 {
        return trimmed.to_string();
    }

    let (sec, min, hour) = (padded[0], padded[1], padded[2]);
    let rest_wild = padded[3..].iter().all(|f| *f == "*");

    if rest_wild {
        if let Some(n) = sec.strip_prefix("*/") {
            if min == "*" && hour == "*" {
                return format!("every {n} seconds");
            }
        }
        if sec == "0" {
            if let Some(n) = min.strip_prefix("*/") {
                if hour == "*" {
                    return format!("every {n} minutes");
                }
            }
            if min == "*" && hour == "*" {
                return "every minute".to_string();
            }
            if let Some(n) = hour.strip_prefix("*/") {
                if min != "*" {
                    return format!("every {n} hours at minute {min}");
                }
            }
            if hour != "*" && min != "*" && !hour.contains(['*', '/']) && !min.contains(['*', '/'])
            {
                return format!("daily at {hour:0>2}:{min:0>2}");
            }
        }
    }

    trimmed.to_string()
}

/// Installs and owns the periodic tasks for timed agents.
pub struct CronScheduler {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Install the periodic task for one timed agent.
    pub fn install(
        &self,
        agent_id: String,
        schedule: Schedule,
        emitter: EventEmitter,
        on_tick: TickFn,
    ) {
        emitter.emit(MillEvent::Scheduled {
            agent_id: agent_id.clone(),
        });

        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut after = Utc::now();
            loop {
                let Some(next) = schedule.after(&after).next() else {
                    debug!(agent = %agent_id, "Schedule exhausted");
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        emitter.emit(MillEvent::Tick { agent_id: agent_id.clone() });
                        on_tick(&agent_id);
                        after = next;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(agent = %agent_id, "Scheduler task paused");
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop all tasks. In-flight runs launched by earlier ticks are not
    /// touched.
    pub fn pause(&self) {
        let _ = self.shutdown.send(true);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.pause();
    }
}
