//! Sandbox host trait and process types.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use kiln_artifact::FileNode;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{HostError, HostResult};

static ANSI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

static LOCAL_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{2,5})[^\s]*").unwrap()
});

/// One line of process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: chrono::DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogLine {
    pub fn stdout(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::Stdout,
            message: message.into(),
        }
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::Stderr,
            message: message.into(),
        }
    }
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Out-of-band notice that a server inside the sandbox accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    pub port: Option<u16>,
    pub url: String,
}

/// Cloneable handle that terminates a spawned process.
#[derive(Clone, Default)]
pub struct KillHandle {
    sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl KillHandle {
    /// Create a handle and the receiver the process driver listens on.
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Request termination. Returns `false` if already requested or finished.
    pub fn kill(&self) -> bool {
        match self.sender.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for KillHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillHandle")
            .field("armed", &self.sender.lock().is_some())
            .finish()
    }
}

/// A process started inside the sandbox.
///
/// `output` closes once the process has exited and its streams are drained;
/// `exit` then resolves with the exit code.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub id: String,
    /// Command line, for display
    pub command: String,
    pub output: mpsc::UnboundedReceiver<LogLine>,
    pub exit: oneshot::Receiver<i64>,
    kill: KillHandle,
}

impl SpawnedProcess {
    pub fn new(
        command: impl Into<String>,
        output: mpsc::UnboundedReceiver<LogLine>,
        exit: oneshot::Receiver<i64>,
        kill: KillHandle,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            output,
            exit,
            kill,
        }
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    pub fn kill(&self) -> bool {
        self.kill.kill()
    }

    /// Split into output, exit and kill handle for callers that drive the
    /// channels themselves.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<LogLine>, oneshot::Receiver<i64>, KillHandle) {
        (self.output, self.exit, self.kill)
    }

    /// Drain all output through `on_line`, then wait for the exit code.
    pub async fn wait_with_output(mut self, mut on_line: impl FnMut(LogLine)) -> HostResult<i64> {
        while let Some(line) = self.output.recv().await {
            on_line(line);
        }
        self.exit
            .await
            .map_err(|_| HostError::ProcessLost(self.command.clone()))
    }
}

/// Sandbox host trait.
///
/// The engine depends only on these primitives; paths are relative to the
/// sandbox root and slash-delimited.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    /// Write a complete tree snapshot into the sandbox filesystem.
    async fn mount(&self, tree: &[FileNode]) -> HostResult<()>;

    /// Start a process in the sandbox root.
    async fn spawn(&self, command: &str, args: &[String]) -> HostResult<SpawnedProcess>;

    /// Create a directory.
    async fn mkdir(&self, path: &str, recursive: bool) -> HostResult<()>;

    /// Create or overwrite a file.
    async fn write_file(&self, path: &str, content: &str) -> HostResult<()>;

    /// Subscribe to server-ready notifications.
    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

/// Remove terminal colour/control sequences from a line.
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_REGEX.replace_all(line, "")
}

/// Detect a local server address announced in process output.
pub fn detect_server_ready(line: &str) -> Option<ServerReady> {
    let clean = strip_ansi(line);
    let caps = LOCAL_URL_REGEX.captures(&clean)?;
    let url = caps.get(0)?.as_str().trim_end_matches(['.', ',', ')']).to_string();
    let port = caps.get(1).and_then(|m| m.as_str().parse().ok());
    Some(ServerReady { port, url })
}
