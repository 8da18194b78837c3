//! Subprocess bridge: one spawned stdio MCP server and its newline-delimited JSON pipes.

use crate::error::{ProxyError, Result};
use crate::jsonrpc::{self, JsonRpcMessage, Payload};
use crate::registry::ServerLaunchSpec;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Span};

/// Capacity of the stdout event channel; a slow consumer back-pressures the reader.
const BRIDGE_EVENT_BUFFER: usize = 256;

/// How long stdout may keep draining after the process exited.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Default time a subprocess gets after stdin is closed, and again after SIGTERM.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub stop_grace: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Something the subprocess produced on stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Message(JsonRpcMessage),
    /// Terminal: the process exited, or stdout reached EOF or could not be read.
    Closed(String),
}

/// Owns one child process. Writes are serialized; reads happen on a background task.
///
/// The child itself lives on a supervisor task that reports its exit and carries out
/// [`Bridge::stop`].
pub struct Bridge {
    command: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<BridgeEvent>>>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stderr: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Spawn the server described by `spec`. Background tasks run inside `span`.
    pub fn start(spec: &ServerLaunchSpec, options: &BridgeOptions, span: &Span) -> Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::BridgeClosed("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::BridgeClosed("child stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(BRIDGE_EVENT_BUFFER);
        let reader = tokio::spawn(read_stdout(stdout, tx.clone()).instrument(span.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(log_stderr(stderr).instrument(span.clone())));

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(
            supervise(child, reader, tx, shutdown.clone(), options.stop_grace)
                .instrument(span.clone()),
        );

        tracing::info!(
            parent: span,
            pid,
            command = %spec.command,
            args = ?spec.args,
            "subprocess started"
        );

        Ok(Self {
            command: spec.command.clone(),
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            events: parking_lot::Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
            shutdown,
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
            stderr,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Write one message or batch as a single line.
    ///
    /// A failed write closes stdin for good; later sends fail immediately.
    pub async fn send(&self, payload: &Payload) -> Result<()> {
        let mut line = payload.to_line();
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProxyError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "subprocess stdin is closed",
            )));
        };

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            guard.take();
            return Err(ProxyError::Write(e));
        }
        Ok(())
    }

    /// Messages parsed from stdout, ending with [`BridgeEvent::Closed`].
    ///
    /// Only the first call gets the stream; later calls return `None`.
    pub fn recv_stream(&self) -> Option<ReceiverStream<BridgeEvent>> {
        self.events.lock().take().map(ReceiverStream::new)
    }

    /// Close stdin, then escalate to SIGTERM and SIGKILL, each after `stop_grace`.
    /// Idempotent; returns once the process is reaped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.stdin.lock().await.take());
        self.shutdown.cancel();

        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor
            && let Err(e) = supervisor.await
        {
            tracing::warn!(pid = self.pid, error = %e, "subprocess supervisor failed");
        }

        if let Some(stderr) = &self.stderr {
            stderr.abort();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // The supervisor reaps (or kills) the child once it sees the token.
        self.shutdown.cancel();
        if let Some(stderr) = &self.stderr {
            stderr.abort();
        }
    }
}

/// Own the child: report its exit as [`BridgeEvent::Closed`] and shut it down on request.
async fn supervise(
    mut child: Child,
    mut reader: JoinHandle<String>,
    tx: mpsc::Sender<BridgeEvent>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let pid = child.id();
    let mut exited = false;

    let reason = tokio::select! {
        () = shutdown.cancelled() => {
            terminate(&mut child, pid, grace).await;
            reader.abort();
            return;
        }
        status = child.wait() => {
            exited = true;
            // Replies written just before exit may still sit in the pipe.
            if tokio::time::timeout(EXIT_DRAIN, &mut reader).await.is_err() {
                tracing::debug!(pid, "stdout still held open after exit");
                reader.abort();
            }
            exit_reason(status)
        }
        finished = &mut reader => {
            finished.unwrap_or_else(|e| format!("stdout reader failed: {e}"))
        }
    };

    tracing::debug!(pid, reason = %reason, "subprocess closed");
    let _ = tx.send(BridgeEvent::Closed(reason)).await;
    drop(tx);

    if !exited {
        // Stdout is gone but the process may still run; reap it on exit or stop.
        tokio::select! {
            () = shutdown.cancelled() => terminate(&mut child, pid, grace).await,
            status = child.wait() => {
                tracing::debug!(pid, reason = %exit_reason(status), "subprocess exited");
            }
        }
    }
}

fn exit_reason(status: io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => format!("subprocess exited: {status}"),
        Err(e) => format!("failed to wait for subprocess: {e}"),
    }
}

/// Stdin is already closed; wait, then SIGTERM, wait again, then SIGKILL and reap.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        tracing::debug!(
            pid,
            reason = %exit_reason(status),
            "subprocess exited after stdin closed"
        );
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) {
            tracing::debug!(pid, grace_ms, "subprocess ignored stdin close; sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                tracing::warn!(pid, error = %e, "failed to send SIGTERM");
            }
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                tracing::debug!(
                    pid,
                    reason = %exit_reason(status),
                    "subprocess exited after SIGTERM"
                );
                return;
            }
        }
    }

    tracing::warn!(pid, grace_ms, "subprocess did not exit; killing");
    if let Err(e) = child.kill().await {
        tracing::warn!(pid, error = %e, "failed to kill subprocess");
    }
}

/// Forward stdout until EOF. Returns why reading stopped.
async fn read_stdout(stdout: ChildStdout, tx: mpsc::Sender<BridgeEvent>) -> String {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return "subprocess closed stdout".to_string(),
            Ok(_) => {
                let line = buf.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                match jsonrpc::decode_line(line) {
                    Ok(messages) => {
                        for message in messages {
                            if tx.send(BridgeEvent::Message(message)).await.is_err() {
                                return "bridge events dropped".to_string();
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            line = %String::from_utf8_lossy(line),
                            "dropping malformed line from subprocess stdout"
                        );
                    }
                }
            }
            Err(e) => return format!("failed to read subprocess stdout: {e}"),
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    tracing::debug!(line = %line, "subprocess stderr");
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading subprocess stderr");
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use std::collections::HashMap;
    use std::time::Instant;

    fn sh(script: &str) -> ServerLaunchSpec {
        ServerLaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        }
    }

    fn start(spec: &ServerLaunchSpec) -> Bridge {
        Bridge::start(spec, &BridgeOptions::default(), &Span::none()).expect("spawn")
    }

    fn ping(id: i64) -> Payload {
        Payload::Single(JsonRpcMessage::request(id, "ping", None))
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spec = ServerLaunchSpec {
            command: "/nonexistent/mcp-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        let err = Bridge::start(&spec, &BridgeOptions::default(), &Span::none())
            .err()
            .expect("spawn must fail");
        assert!(matches!(err, ProxyError::Spawn { .. }));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let bridge = start(&sh(
            r#"read line; echo "not json"; echo ""; echo '{"jsonrpc":"2.0","result":{"ok":true},"id":1}'; cat >/dev/null"#,
        ));
        let mut events = bridge.recv_stream().expect("first take");

        bridge.send(&ping(1)).await.expect("send");

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("reply in time")
            .expect("stream open");
        let BridgeEvent::Message(message) = event else {
            panic!("expected a message, got {event:?}");
        };
        assert_eq!(message.response_id(), Some(&1.into()));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn env_is_passed_to_the_child() {
        let mut spec = sh(
            r#"printf '{"jsonrpc":"2.0","method":"hello","params":{"v":"%s"}}\n' "$MCP_TEST_VALUE"; cat >/dev/null"#,
        );
        spec.env
            .insert("MCP_TEST_VALUE".to_string(), "from-spec".to_string());
        let bridge = start(&spec);
        let mut events = bridge.recv_stream().expect("first take");

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event in time")
            .expect("stream open");
        let BridgeEvent::Message(JsonRpcMessage::Notification { params, .. }) = event else {
            panic!("expected a notification, got {event:?}");
        };
        assert_eq!(params.expect("params")["v"], "from-spec");
        bridge.stop().await;
    }

    #[tokio::test]
    async fn exit_surfaces_as_closed_and_stream_is_not_restartable() {
        let bridge = start(&sh("exit 0"));
        let mut events = bridge.recv_stream().expect("first take");
        assert!(bridge.recv_stream().is_none());

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event in time")
            .expect("stream open");
        assert!(matches!(event, BridgeEvent::Closed(_)));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn exit_is_reported_while_a_grandchild_holds_stdout() {
        let bridge = start(&sh("sleep 10 & exit 3"));
        let mut events = bridge.recv_stream().expect("first take");

        let event = tokio::time::timeout(Duration::from_secs(3), events.next())
            .await
            .expect("exit reported before stdout EOF")
            .expect("stream open");
        let BridgeEvent::Closed(reason) = event else {
            panic!("expected closed, got {event:?}");
        };
        assert!(reason.contains("exit status: 3"), "reason: {reason}");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn replies_written_right_before_exit_are_delivered() {
        let bridge = start(&sh(
            r#"read line; echo '{"jsonrpc":"2.0","result":{},"id":1}'; exit 0"#,
        ));
        let mut events = bridge.recv_stream().expect("first take");
        bridge.send(&ping(1)).await.expect("send");

        let first = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("reply in time")
            .expect("stream open");
        assert!(matches!(first, BridgeEvent::Message(_)), "got {first:?}");
        let second = events.next().await.expect("closed event");
        assert!(matches!(second, BridgeEvent::Closed(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_stdin() {
        let bridge = start(&sh("cat >/dev/null"));
        assert!(bridge.pid().is_some());

        bridge.stop().await;
        bridge.stop().await;
        assert!(bridge.is_stopped());
        assert!(matches!(
            bridge.send(&ping(1)).await,
            Err(ProxyError::Write(_))
        ));
    }

    #[tokio::test]
    async fn stop_kills_a_process_that_ignores_eof() {
        let options = BridgeOptions {
            stop_grace: Duration::from_millis(100),
        };
        let bridge = Bridge::start(
            &sh("trap '' TERM; while true; do sleep 1; done"),
            &options,
            &Span::none(),
        )
        .expect("spawn");

        let started = Instant::now();
        bridge.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stop_sends_sigterm_before_killing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("terminated");
        let mut spec =
            sh(r#"trap 'touch "$MARKER"; exit 0' TERM; while true; do sleep 0.1; done"#);
        spec.env
            .insert("MARKER".to_string(), marker.display().to_string());
        let options = BridgeOptions {
            stop_grace: Duration::from_millis(300),
        };
        let bridge = Bridge::start(&spec, &options, &Span::none()).expect("spawn");

        bridge.stop().await;
        assert!(marker.exists(), "SIGTERM trap did not run");
    }
}
