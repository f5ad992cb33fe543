//! Stdio transport with stdout log filtering
//!
//! Wraps an upstream MCP process whose stdout intermixes JSON-RPC frames with
//! human log lines. Complete lines that parse as JSON-RPC are forwarded as
//! frames; everything else is rerouted to the logger with a level inferred
//! from the line text. Stderr is always forwarded at warn level.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::client::McpClientError;

/// Grace period between SIGTERM and SIGKILL on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Events emitted by the adapter's reader task
#[derive(Debug)]
pub enum StdioEvent {
    /// A well-formed JSON-RPC frame read from stdout
    Frame(Value),
    /// The process exited (EOF on stdout). Not emitted on explicit shutdown.
    Closed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Log level inferred from a non-JSON stdout line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferredLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn level_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)^(DEBUG|INFO|WARNING|ERROR|CRITICAL)\s+").unwrap(),
            Regex::new(r"(?i)^\[(DEBUG|INFO|WARNING|ERROR|CRITICAL)\]").unwrap(),
            Regex::new(r"(?i)\s(DEBUG|INFO|WARNING|ERROR|CRITICAL)\s").unwrap(),
        ]
    })
}

/// Classify a contaminating stdout line. Unmatched lines default to info.
pub fn infer_level(line: &str) -> InferredLevel {
    for pattern in level_patterns() {
        if let Some(caps) = pattern.captures(line) {
            return match caps
                .get(1)
                .map(|m| m.as_str().to_ascii_uppercase())
                .as_deref()
            {
                Some("DEBUG") => InferredLevel::Debug,
                Some("WARNING") => InferredLevel::Warn,
                Some("ERROR") | Some("CRITICAL") => InferredLevel::Error,
                _ => InferredLevel::Info,
            };
        }
    }
    InferredLevel::Info
}

/// Accept a parsed line as JSON-RPC iff it is an object with `jsonrpc: "2.0"`
/// and looks like a request, notification, result, or error.
pub fn is_jsonrpc_frame(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return false;
    }
    let has_id = obj.contains_key("id");
    obj.contains_key("method")
        || (obj.contains_key("result") && has_id)
        || (obj.contains_key("error") && has_id)
}

/// Drain complete newline-terminated lines out of `buf`, retaining the last
/// (possibly incomplete) fragment.
pub fn drain_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop(); // trailing \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(line);
    }
    lines
}

/// A spawned stdio MCP process with log-filtered stdout
pub struct FilteredStdioProcess {
    name: String,
    pid: Option<u32>,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl FilteredStdioProcess {
    /// Spawn the process and start the stdout/stderr reader tasks.
    ///
    /// Returns the process handle plus the event stream carrying accepted
    /// frames and the close notification.
    pub async fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StdioEvent>), McpClientError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpClientError::ProcessError(format!("Failed to spawn {}: {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpClientError::ProcessError("Failed to capture stderr".to_string()))?;

        let pid = child.id();
        let child = Arc::new(Mutex::new(Some(child)));
        let (tx, rx) = mpsc::unbounded_channel();

        // Stderr is never part of the protocol; forward every line at warn
        let stderr_name = name.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    tracing::warn!(server = %stderr_name, stderr = %trimmed, "upstream stderr");
                }
            }
        });

        // Stdout reader: byte buffer, split on newline, filter frames
        let reader_name = name.to_string();
        let reader_child = Arc::clone(&child);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf: Vec<u8> = Vec::with_capacity(8192);
            let mut chunk = [0u8; 8192];

            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        for line in drain_lines(&mut buf) {
                            dispatch_line(&reader_name, &line, &tx);
                        }
                    }
                }
            }

            // EOF: reap the child and report how it went down. If shutdown()
            // already took the child, this was an orderly close.
            let taken = reader_child.lock().await.take();
            if let Some(mut child) = taken {
                let status = child.wait().await.ok();
                let (exit_code, signal) = split_status(status);
                tracing::info!(
                    server = %reader_name,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "stdio upstream exited"
                );
                let _ = tx.send(StdioEvent::Closed { exit_code, signal });
            }
        });

        Ok((
            Self {
                name: name.to_string(),
                pid,
                child,
                stdin: Mutex::new(Some(stdin)),
            },
            rx,
        ))
    }

    /// Write one JSON-RPC frame, newline-delimited, to the process stdin
    pub async fn send(&self, frame: &Value) -> Result<(), McpClientError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpClientError::NotInitialized)?;
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Graceful shutdown: close stdin, SIGTERM, escalate to SIGKILL after the
    /// grace period.
    pub async fn shutdown(&self) {
        // Closing stdin lets well-behaved servers exit on their own
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.name, status = ?status, "stdio upstream terminated");
            }
            Ok(Err(e)) => {
                tracing::error!(server = %self.name, error = %e, "error waiting for upstream exit");
            }
            Err(_) => {
                tracing::warn!(server = %self.name, "upstream unresponsive to SIGTERM, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

fn dispatch_line(name: &str, line: &[u8], tx: &mpsc::UnboundedSender<StdioEvent>) {
    if line.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if is_jsonrpc_frame(&value) {
            let _ = tx.send(StdioEvent::Frame(value));
            return;
        }
    }

    match infer_level(trimmed) {
        InferredLevel::Debug => tracing::debug!(server = %name, line = %trimmed, "upstream log"),
        InferredLevel::Info => tracing::info!(server = %name, line = %trimmed, "upstream log"),
        InferredLevel::Warn => tracing::warn!(server = %name, line = %trimmed, "upstream log"),
        InferredLevel::Error => tracing::error!(server = %name, line = %trimmed, "upstream log"),
    }
}

fn split_status(status: Option<std::process::ExitStatus>) -> (Option<i32>, Option<i32>) {
    match status {
        Some(status) => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                (status.code(), status.signal())
            }
            #[cfg(not(unix))]
            {
                (status.code(), None)
            }
        }
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // =========================================================================
    // Level inference
    // =========================================================================

    #[test]
    fn infer_level_leading_keyword() {
        assert_eq!(infer_level("ERROR  something broke"), InferredLevel::Error);
        assert_eq!(infer_level("DEBUG   starting up"), InferredLevel::Debug);
        assert_eq!(infer_level("WARNING disk almost full"), InferredLevel::Warn);
    }

    #[test]
    fn infer_level_bracketed_keyword() {
        assert_eq!(infer_level("[CRITICAL] out of memory"), InferredLevel::Error);
        assert_eq!(infer_level("[info] listening on :8080"), InferredLevel::Info);
    }

    #[test]
    fn infer_level_embedded_keyword() {
        assert_eq!(
            infer_level("2024-01-01T00:00:00 ERROR db unreachable"),
            InferredLevel::Error
        );
    }

    #[test]
    fn infer_level_case_insensitive() {
        assert_eq!(infer_level("warning low disk"), InferredLevel::Warn);
    }

    #[test]
    fn infer_level_defaults_to_info() {
        assert_eq!(infer_level("Server ready on port 3000"), InferredLevel::Info);
        // ERRORS does not match the \s-delimited ladder
        assert_eq!(infer_level("no ERRORS found"), InferredLevel::Info);
    }

    // =========================================================================
    // Frame acceptance
    // =========================================================================

    #[test]
    fn accepts_request_with_id() {
        assert!(is_jsonrpc_frame(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        })));
    }

    #[test]
    fn accepts_notification_without_id() {
        assert!(is_jsonrpc_frame(&json!({
            "jsonrpc": "2.0", "method": "notifications/progress", "params": {}
        })));
    }

    #[test]
    fn accepts_result_and_error_with_id() {
        assert!(is_jsonrpc_frame(&json!({
            "jsonrpc": "2.0", "id": 1, "result": {}
        })));
        assert!(is_jsonrpc_frame(&json!({
            "jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "x"}
        })));
    }

    #[test]
    fn rejects_result_without_id() {
        assert!(!is_jsonrpc_frame(&json!({
            "jsonrpc": "2.0", "result": {}
        })));
    }

    #[test]
    fn rejects_wrong_version_and_non_objects() {
        assert!(!is_jsonrpc_frame(&json!({
            "jsonrpc": "1.0", "id": 1, "method": "x"
        })));
        assert!(!is_jsonrpc_frame(&json!({"id": 1, "method": "x"})));
        assert!(!is_jsonrpc_frame(&json!([1, 2, 3])));
        assert!(!is_jsonrpc_frame(&json!("2.0")));
    }

    // =========================================================================
    // Line splitting
    // =========================================================================

    #[test]
    fn drain_lines_splits_complete_lines() {
        let mut buf = b"one\ntwo\nthree".to_vec();
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(buf, b"three".to_vec());
    }

    #[test]
    fn drain_lines_handles_chunk_boundary() {
        // A frame split across two read chunks must come out as one line
        let mut buf = Vec::new();
        buf.extend_from_slice(br#"{"jsonrpc":"2.0","id":1,"re"#);
        assert!(drain_lines(&mut buf).is_empty());

        buf.extend_from_slice(b"sult\":{}}\n");
        let lines = drain_lines(&mut buf);
        assert_eq!(lines.len(), 1);
        let value: Value = serde_json::from_slice(&lines[0]).unwrap();
        assert!(is_jsonrpc_frame(&value));
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_lines_strips_carriage_return() {
        let mut buf = b"hello\r\n".to_vec();
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec![b"hello".to_vec()]);
    }

    // =========================================================================
    // End to end against a real process
    // =========================================================================

    #[tokio::test]
    async fn spawn_filters_logs_from_frames() {
        // Emits one log line and one frame on stdout
        let script = r#"echo "INFO  warming up"; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#;
        let (proc_, mut rx) = FilteredStdioProcess::spawn(
            "test",
            "sh",
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
            None,
        )
        .await
        .expect("spawn failed");

        let mut frames = Vec::new();
        let mut closed = false;
        while let Some(event) = rx.recv().await {
            match event {
                StdioEvent::Frame(v) => frames.push(v),
                StdioEvent::Closed { .. } => {
                    closed = true;
                    break;
                }
            }
        }

        assert_eq!(frames.len(), 1, "log line must not become a frame");
        assert_eq!(frames[0]["result"]["ok"], json!(true));
        assert!(closed);
        proc_.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_kills_stubborn_process() {
        let (proc_, _rx) = FilteredStdioProcess::spawn(
            "sleeper",
            "sh",
            &["-c".to_string(), "trap '' TERM; sleep 60".to_string()],
            &HashMap::new(),
            None,
        )
        .await
        .expect("spawn failed");

        // Must return despite the ignored SIGTERM (escalates to SIGKILL)
        tokio::time::timeout(Duration::from_secs(10), proc_.shutdown())
            .await
            .expect("shutdown did not complete");
    }
}
