//! Standard I/O transport.
//!
//! Spawns a child process and exchanges newline-delimited JSON frames over
//! its stdin/stdout.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Inbox, InboxSender};
use crate::error::TransportError;

/// Standard I/O transport for MCP servers.
pub struct StdioTransport {
    /// The child process.
    child: Mutex<Child>,
    /// Stdin writer; taken on close.
    stdin: Mutex<Option<ChildStdin>>,
    /// Frames read from stdout.
    inbox: Inbox,
    /// Set once the process has produced a frame.
    spoke: Arc<AtomicBool>,
    cancel: CancellationToken,
    closed: AtomicBool,
    grace: Duration,
    pid: Option<u32>,
}

impl StdioTransport {
    /// Spawn a new stdio transport.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to execute (e.g., "npx" or "/path/to/server")
    /// * `args` - Command arguments
    /// * `env` - Environment variables to set for the child process
    /// * `working_dir` - Optional working directory for the child process
    /// * `grace` - How long to wait after SIGTERM before killing
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
        grace: Duration,
    ) -> Result<Self, TransportError> {
        debug!(command = command, args = ?args, "Spawning MCP server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("{}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("failed to capture stdout".to_string()))?;

        let cancel = CancellationToken::new();
        let (inbox, sender) = Inbox::new(cancel.clone());
        let spoke = Arc::new(AtomicBool::new(false));
        tokio::spawn(pump(stdout, sender, Arc::clone(&spoke), cancel.clone()));

        let pid = child.id();
        debug!(pid = ?pid, "MCP server process spawned");

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            inbox,
            spoke,
            cancel,
            closed: AtomicBool::new(false),
            grace,
            pid,
        })
    }

    /// Get the process ID of the child process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn send(&self, message: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;

        debug!(message = message, "Sending message to MCP server");

        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\n');

        let result = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|e| {
            if self.spoke.load(Ordering::SeqCst) {
                TransportError::Write(e.to_string())
            } else {
                TransportError::SpawnFailed(format!("process exited before the handshake: {}", e))
            }
        })
    }

    pub async fn receive(&self) -> Result<String, TransportError> {
        self.inbox.next().await
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(pid = ?self.pid, "Closing MCP server transport");
        self.cancel.cancel();
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            debug!(pid = pid, "Sending SIGTERM to MCP server");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            tokio::select! {
                _ = child.wait() => {
                    debug!("MCP server exited gracefully");
                    return;
                }
                _ = tokio::time::sleep(self.grace) => {
                    warn!(pid = pid, "MCP server did not exit gracefully, killing");
                }
            }
        }

        let _ = child.kill().await;
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.inbox.has_ended()
    }
}

async fn pump(stdout: ChildStdout, sender: InboxSender, spoke: Arc<AtomicBool>, cancel: CancellationToken) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                spoke.store(true, Ordering::SeqCst);
                debug!(message = line, "Received message from MCP server");
                if !sender.deliver(line.to_string()) {
                    return;
                }
            }
            Ok(None) => {
                let reason = if spoke.load(Ordering::SeqCst) {
                    TransportError::Closed
                } else {
                    TransportError::SpawnFailed("process exited before sending any message".to_string())
                };
                sender.finish(reason);
                return;
            }
            Err(e) => {
                sender.finish(TransportError::Protocol(format!("failed to read stdout: {}", e)));
                return;
            }
        }
    }
}
