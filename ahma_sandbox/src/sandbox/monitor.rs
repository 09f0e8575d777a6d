//! # Violation Monitor
//!
//! Reads kernel denial events for one invocation and turns them into a typed
//! [`Violation`] stream.
//!
//! Events come from an [`EventSource`]. In production that is
//! [`LogStreamSource`], a `log stream --style ndjson` subprocess whose
//! predicate only passes events carrying the invocation's correlation ID.
//! Tests substitute a [`FixtureSource`].
//!
//! Lifecycle: `Idle → Streaming → Stopped`, tracked by a
//! [`MonitorStateMachine`]. The reader stops when the shared cancellation
//! token fires or the source ends. On cancellation, lines the source has
//! already produced are still delivered until it goes quiet for
//! [`DRAIN_IDLE`] (at most [`DRAIN_LIMIT`] in total); later lines are dropped.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use ahma_common::monitor_state::{MonitorState, MonitorStateMachine};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::correlation::CorrelationId;
use super::error::{SandboxError, SandboxResult};
use super::violations::Violation;

/// Capacity of the violation channel between reader and sink.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Quiet period that ends the post-cancellation drain.
pub const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Upper bound on the post-cancellation drain.
pub const DRAIN_LIMIT: Duration = Duration::from_secs(1);

pub type EventLines = Box<dyn AsyncBufRead + Send + Unpin>;

/// Something that yields newline-delimited raw log events.
pub trait EventSource: Send + 'static {
    fn open(&mut self) -> io::Result<EventLines>;

    /// Release whatever `open` acquired. Called once, after reading ends.
    fn close(&mut self) {}
}

impl EventSource for Box<dyn EventSource> {
    fn open(&mut self) -> io::Result<EventLines> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// The host `log stream` tool, filtered to one invocation.
#[derive(Debug)]
pub struct LogStreamSource {
    program: PathBuf,
    predicate: String,
    child: Option<Child>,
}

impl LogStreamSource {
    pub fn new(id: &CorrelationId) -> Self {
        Self {
            program: PathBuf::from("/usr/bin/log"),
            predicate: format!(
                "(process == \"sandboxd\" OR sender == \"Sandbox\") AND eventMessage CONTAINS \"{id}\""
            ),
            child: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "stream".to_string(),
            "--predicate".to_string(),
            self.predicate.clone(),
            "--style".to_string(),
            "ndjson".to_string(),
            "--level".to_string(),
            "default".to_string(),
        ]
    }
}

impl EventSource for LogStreamSource {
    fn open(&mut self) -> io::Result<EventLines> {
        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("log stream has no stdout"))?;
        self.child = Some(child);
        Ok(Box::new(BufReader::new(stdout)))
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(error = %e, "log stream already exited");
        }
    }
}

/// Fixed lines, for tests and replaying captured logs.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    lines: Vec<String>,
}

impl FixtureSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventSource for FixtureSource {
    fn open(&mut self) -> io::Result<EventLines> {
        let mut data = self.lines.join("\n");
        data.push('\n');
        Ok(Box::new(io::Cursor::new(data.into_bytes())))
    }
}

#[derive(Debug)]
pub struct ViolationMonitor {
    state: MonitorStateMachine,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ViolationMonitor {
    /// Open `source` and start reading on a background task.
    ///
    /// `tag` is stripped from event messages before classification.
    /// Fails with [`SandboxError::MonitorUnavailable`] if the source cannot be
    /// opened; callers are expected to carry on without auditing.
    pub fn start<S: EventSource>(
        mut source: S,
        tag: Option<String>,
        cancel: CancellationToken,
    ) -> SandboxResult<(Self, mpsc::Receiver<Violation>)> {
        let state = MonitorStateMachine::new();
        let lines = match source.open() {
            Ok(lines) => lines,
            Err(e) => {
                state.transition_to_stopped();
                return Err(SandboxError::MonitorUnavailable(e.to_string()));
            }
        };
        state
            .transition_to_streaming()
            .map_err(|e| SandboxError::MonitorUnavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(read_events(
            source,
            lines,
            tag,
            tx,
            cancel.clone(),
            state.clone(),
        ));

        Ok((
            Self {
                state,
                cancel,
                task,
            },
            rx,
        ))
    }

    pub fn state(&self) -> MonitorState {
        self.state.current()
    }

    pub fn state_machine(&self) -> &MonitorStateMachine {
        &self.state
    }

    /// Cancel reading and wait for the source to be closed.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "violation monitor task failed");
        }
    }
}

async fn read_events<S: EventSource>(
    mut source: S,
    lines: EventLines,
    tag: Option<String>,
    tx: mpsc::Sender<Violation>,
    cancel: CancellationToken,
    state: MonitorStateMachine,
) {
    let mut lines = lines.lines();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            line = lines.next_line() => Some(line),
        };
        let Some(line) = next else {
            let drained = drain_buffered(&mut lines, tag.as_deref(), &tx).await;
            debug!(drained, "violation monitor cancelled");
            break;
        };

        match line {
            Ok(Some(line)) => {
                if !forward(&line, tag.as_deref(), &tx).await {
                    break;
                }
            }
            Ok(None) => {
                debug!("log stream ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "log stream read failed");
                break;
            }
        }
    }

    source.close();
    state.transition_to_stopped();
}

/// Decode and send one raw line. `false` once the receiver is gone.
async fn forward(line: &str, tag: Option<&str>, tx: &mpsc::Sender<Violation>) -> bool {
    match Violation::parse_event(line, tag) {
        Ok(violation) => tx.send(violation).await.is_ok(),
        Err(e) => {
            trace!(error = %e, "skipping log line");
            true
        }
    }
}

/// Forward lines the source already produced, without waiting for new ones.
async fn drain_buffered(
    lines: &mut Lines<EventLines>,
    tag: Option<&str>,
    tx: &mpsc::Sender<Violation>,
) -> usize {
    let deadline = Instant::now() + DRAIN_LIMIT;
    let mut drained = 0;
    loop {
        let wait = (Instant::now() + DRAIN_IDLE).min(deadline);
        match timeout_at(wait, lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                drained += 1;
                if !forward(&line, tag, tx).await {
                    break;
                }
            }
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => break,
        }
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::violations::Operation;
    use tokio::io::DuplexStream;

    const READ: &str = r#"{"eventMessage":"Sandbox: cat(1) deny(1) file-read-data /Users/me/.ssh/id_rsa ahma-1-x"}"#;
    const WRITE: &str = r#"{"eventMessage":"Sandbox: touch(2) deny(1) file-write-create /etc/hosts ahma-1-x"}"#;

    /// Never yields a line until the writer half is dropped.
    struct PendingSource {
        writer: Option<DuplexStream>,
        reader: Option<DuplexStream>,
        closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl EventSource for PendingSource {
        fn open(&mut self) -> io::Result<EventLines> {
            let reader = self.reader.take().ok_or_else(|| io::Error::other("opened twice"))?;
            Ok(Box::new(BufReader::new(reader)))
        }

        fn close(&mut self) {
            self.writer.take();
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct BrokenSource;

    impl EventSource for BrokenSource {
        fn open(&mut self) -> io::Result<EventLines> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no log tool"))
        }
    }

    #[tokio::test]
    async fn fixture_events_are_classified_in_order() {
        let source = FixtureSource::new([READ, "garbage", "", WRITE]);
        let (monitor, mut rx) =
            ViolationMonitor::start(source, Some("ahma-1-x".into()), CancellationToken::new())
                .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(first.operation, Operation::FileRead);
        assert_eq!(first.target, "/Users/me/.ssh/id_rsa");
        assert_eq!(second.process, "touch");
        assert_eq!(second.operation, Operation::FileWrite);

        monitor.state_machine().wait_for_stopped().await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn cancellation_stops_a_live_source() {
        let (writer, reader) = tokio::io::duplex(64);
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source = PendingSource {
            writer: Some(writer),
            reader: Some(reader),
            closed: closed.clone(),
        };

        let cancel = CancellationToken::new();
        let (monitor, mut rx) = ViolationMonitor::start(source, None, cancel.child_token()).unwrap();
        assert_eq!(monitor.state(), MonitorState::Streaming);

        cancel.cancel();
        monitor.stop().await;

        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_delivers_lines_already_produced() {
        let source = FixtureSource::new([READ, WRITE, READ]);
        let (monitor, mut rx) =
            ViolationMonitor::start(source, Some("ahma-1-x".into()), CancellationToken::new())
                .unwrap();
        monitor.stop().await;

        let mut delivered = Vec::new();
        while let Some(violation) = rx.recv().await {
            delivered.push(violation.operation);
        }
        assert_eq!(
            delivered,
            vec![Operation::FileRead, Operation::FileWrite, Operation::FileRead]
        );
    }

    #[tokio::test]
    async fn drain_gives_up_on_a_silent_source() {
        let (writer, reader) = tokio::io::duplex(256);
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source = PendingSource {
            writer: Some(writer),
            reader: Some(reader),
            closed: closed.clone(),
        };
        let (monitor, _rx) = ViolationMonitor::start(source, None, CancellationToken::new()).unwrap();

        let started = std::time::Instant::now();
        monitor.stop().await;
        assert!(started.elapsed() < DRAIN_LIMIT + Duration::from_millis(500));
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unavailable_source_is_reported() {
        let err = ViolationMonitor::start(BrokenSource, None, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, SandboxError::MonitorUnavailable(_)));
    }

    #[test]
    fn log_stream_predicate_filters_by_correlation_id() {
        let id = CorrelationId::generate();
        let source = LogStreamSource::new(&id);
        assert!(source.predicate().contains(id.as_str()));
        let args = source.args();
        assert_eq!(args[0], "stream");
        assert!(args.windows(2).any(|w| w[0] == "--style" && w[1] == "ndjson"));
    }
}
