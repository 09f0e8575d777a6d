//! # Violation Classification and Sinks
//!
//! Turns raw `log stream --style ndjson` events into typed [`Violation`]s and
//! delivers them to the two sinks: the durable [`ViolationLogger`] and, in
//! verbose mode, the interactive debug stream.
//!
//! A kernel denial reads like:
//!
//! ```text
//! Sandbox: cat(4242) deny(1) file-read-data /Users/me/.ssh/id_rsa
//! ```
//!
//! The operation is classified by marker (`file-read`, `file-write`,
//! `network`) and the last whitespace-separated token is the target.
//!
//! Ignore rules filter *logging* only. The access was already blocked by the
//! kernel by the time the event is seen, and an ignored violation reaches
//! neither sink.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::{SandboxError, SandboxResult};
use super::violation_logger::ViolationLogger;

/// Key in the ignore map that applies to every process.
pub const ANY_PROCESS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    FileRead,
    FileWrite,
    Network,
    Other,
}

impl Operation {
    /// Classify by the operation token after `deny(N)`. Messages without one
    /// are searched for a marker anywhere.
    pub fn classify(message: &str) -> Self {
        match denied_operation().captures(message).and_then(|c| c.get(1)) {
            Some(token) => Self::from_marker(token.as_str(), |t, m| t.starts_with(m)),
            None => Self::from_marker(message, |t, m| t.contains(m)),
        }
    }

    fn from_marker(text: &str, has: fn(&str, &str) -> bool) -> Self {
        if has(text, "file-read") {
            Operation::FileRead
        } else if has(text, "file-write") {
            Operation::FileWrite
        } else if has(text, "network") {
            Operation::Network
        } else {
            Operation::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FileRead => "file-read",
            Operation::FileWrite => "file-write",
            Operation::Network => "network",
            Operation::Other => "other",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub process: String,
    pub operation: Operation,
    pub target: String,
    pub timestamp: DateTime<Local>,
}

/// The fields of an ndjson log event that matter here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEvent {
    event_message: Option<String>,
    process_image_path: Option<String>,
    timestamp: Option<String>,
}

fn denied_operation() -> &'static Regex {
    static OPERATION: OnceLock<Regex> = OnceLock::new();
    OPERATION.get_or_init(|| {
        Regex::new(r"deny\(\d+\)\s+(\S+)").expect("denied operation regex must compile")
    })
}

fn kernel_process() -> &'static Regex {
    static PROCESS: OnceLock<Regex> = OnceLock::new();
    PROCESS.get_or_init(|| {
        Regex::new(r"Sandbox:\s+(.+?)\(\d+\)\s+deny").expect("sandbox process regex must compile")
    })
}

impl Violation {
    /// Decode one event line. `tag` is removed from the message before the
    /// target is extracted.
    pub fn parse_event(line: &str, tag: Option<&str>) -> SandboxResult<Self> {
        let event: LogEvent = serde_json::from_str(line)
            .map_err(|e| SandboxError::DecodeSkipped(format!("not a log event: {e}")))?;

        let message = event
            .event_message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| SandboxError::DecodeSkipped("event has no message".to_string()))?;

        let timestamp = event
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Local::now);

        let fallback = event
            .process_image_path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or("unknown");

        Ok(Self::from_message(&message, fallback, timestamp, tag))
    }

    pub fn from_message(
        message: &str,
        fallback_process: &str,
        timestamp: DateTime<Local>,
        tag: Option<&str>,
    ) -> Self {
        let message = match tag {
            Some(tag) if !tag.is_empty() => message.replace(tag, ""),
            _ => message.to_string(),
        };

        let process = kernel_process()
            .captures(&message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| fallback_process.to_string());

        let target = message
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .to_string();

        Self {
            process,
            operation: Operation::classify(&message),
            target,
            timestamp,
        }
    }
}

/// `log stream` timestamps look like `2025-01-15 10:30:45.123456-0800`.
fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%z")
        .ok()
        .map(|ts| ts.with_timezone(&Local))
}

/// Substring match of the target against the process's own entry, then the
/// `*` entry.
pub fn should_ignore(violation: &Violation, ignore: &BTreeMap<String, Vec<String>>) -> bool {
    let matches = |key: &str| {
        ignore
            .get(key)
            .is_some_and(|patterns| patterns.iter().any(|p| violation.target.contains(p.as_str())))
    };
    matches(&violation.process) || matches(ANY_PROCESS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Logged,
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub logged: usize,
    pub ignored: usize,
}

/// Consumer end of the violation channel.
#[derive(Debug)]
pub struct ViolationSink {
    ignore: BTreeMap<String, Vec<String>>,
    logger: Option<ViolationLogger>,
    verbose: bool,
    report: SinkReport,
}

impl ViolationSink {
    pub fn new(
        ignore: BTreeMap<String, Vec<String>>,
        logger: Option<ViolationLogger>,
        verbose: bool,
    ) -> Self {
        Self {
            ignore,
            logger,
            verbose,
            report: SinkReport::default(),
        }
    }

    pub fn record(&mut self, violation: &Violation) -> Disposition {
        if should_ignore(violation, &self.ignore) {
            self.report.ignored += 1;
            return Disposition::Ignored;
        }

        if let Some(logger) = self.logger.as_mut()
            && let Err(e) = logger.log(violation)
        {
            warn!(path = %logger.path().display(), error = %e, "failed to write violation log");
        }

        if self.verbose {
            warn!(
                target: "ahma_sandbox::violations",
                process = %violation.process,
                operation = %violation.operation,
                resource = %violation.target,
                time = %violation.timestamp.format("%Y-%m-%d %H:%M:%S"),
                "sandbox violation"
            );
        }

        self.report.logged += 1;
        Disposition::Logged
    }

    pub fn finish(self) -> SinkReport {
        if let Some(logger) = self.logger
            && let Err(e) = logger.close()
        {
            warn!(error = %e, "failed to close violation log");
        }
        self.report
    }

    /// Drain `rx` on a blocking thread until every sender is gone.
    pub fn spawn(mut self, mut rx: mpsc::Receiver<Violation>) -> JoinHandle<SinkReport> {
        tokio::task::spawn_blocking(move || {
            while let Some(violation) = rx.blocking_recv() {
                self.record(&violation);
            }
            let report = self.finish();
            debug!(logged = report.logged, ignored = report.ignored, "violation sink drained");
            report
        })
    }
}
