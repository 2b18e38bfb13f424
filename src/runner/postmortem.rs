//! Supervisor log post-mortem.
//!
//! The supervisor reports exit code 0 both when a worker exits cleanly and
//! when the supervisor itself kills the worker cleanly, so the aggregate
//! log tail is mined to tell the two apart. Parsing is inherently fragile:
//! unparseable lines are "no finding", and no finding means success.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;

/// How many of the trailing log lines are considered.
const TAIL_LINES: usize = 5;

static PROCESS_KILL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<ts>\S+): PM log: pid=(?P<pid>\d+) msg=").unwrap()
});
static PROCESS_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<ts>\S+): PM log: App \[(?P<name>[^:\]]+):(?P<inst>[^\]]*)\] exited with code \[(?P<code>\d+)\] via signal \[(?P<sig>SIGTERM|SIGKILL)\]",
    )
    .unwrap()
});
static PM_KILL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<ts>\S+): PM log: PM successfully stopped").unwrap());

/// One recognized line from the supervisor log tail.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// The supervisor killed a specific pid.
    ProcessKill { pid: u32, at: DateTime<Utc> },
    /// The system delivered a terminating signal to a named app.
    ProcessSignal {
        name: String,
        signal: String,
        code: i32,
        at: DateTime<Utc>,
    },
    /// The supervisor itself went down.
    PmKill,
}

/// Parse one log line. `None` for anything unrecognized, including lines
/// whose timestamp does not parse.
pub fn parse_line(line: &str) -> Option<LogEvent> {
    if let Some(caps) = PROCESS_KILL.captures(line) {
        let at = parse_ts(caps.name("ts")?.as_str())?;
        let pid = caps.name("pid")?.as_str().parse().ok()?;
        return Some(LogEvent::ProcessKill { pid, at });
    }
    if let Some(caps) = PROCESS_SIGNAL.captures(line) {
        let at = parse_ts(caps.name("ts")?.as_str())?;
        return Some(LogEvent::ProcessSignal {
            name: caps.name("name")?.as_str().to_string(),
            signal: caps.name("sig")?.as_str().to_string(),
            code: caps.name("code")?.as_str().parse().ok()?,
            at,
        });
    }
    if PM_KILL.is_match(line) {
        return Some(LogEvent::PmKill);
    }
    None
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Apply the relevance filters and priority order. `Some(cause)` means the
/// clean exit was actually a kill.
pub fn decide(
    events: &[LogEvent],
    child_pid: Option<u32>,
    proc_name: &str,
    started_at: DateTime<Utc>,
) -> Option<String> {
    let killed = events.iter().any(|e| {
        matches!(e, LogEvent::ProcessKill { pid, at }
            if Some(*pid) == child_pid && *at >= started_at)
    });
    if killed {
        return Some("Process killed by supervisor".to_string());
    }

    let signalled = events.iter().find_map(|e| match e {
        LogEvent::ProcessSignal {
            name,
            signal,
            code,
            at,
        } if name == proc_name && *at >= started_at => Some((signal.clone(), *code)),
        _ => None,
    });
    if let Some((signal, code)) = signalled {
        return Some(format!("Process killed by system ({signal} exit code {code})"));
    }

    if events.iter().any(|e| matches!(e, LogEvent::PmKill)) {
        return Some("Supervisor is dead".to_string());
    }

    None
}

/// Seek `tail_size` bytes from the end of the supervisor log, keep the
/// last five lines, and look for evidence that our child was killed.
pub async fn analyze_log_tail(
    path: &Path,
    tail_size: u64,
    child_pid: Option<u32>,
    proc_name: &str,
    started_at: DateTime<Utc>,
) -> Result<Option<String>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = len.saturating_sub(tail_size);
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = Vec::with_capacity(tail_size.min(len) as usize);
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);

    let lines: Vec<&str> = text.lines().collect();
    let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];
    let events: Vec<LogEvent> = tail.iter().filter_map(|l| parse_line(l)).collect();

    Ok(decide(&events, child_pid, proc_name, started_at))
}
