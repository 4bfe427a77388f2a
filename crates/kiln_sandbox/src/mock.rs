//! Mock sandbox host for testing.
//!
//! Records every call, keeps written files in memory and replays scripted
//! process behaviour per command line, so orchestration can be tested
//! without touching the real filesystem or spawning anything.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_artifact::{normalize_path, walk, FileNode};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{HostError, HostResult};
use crate::host::{detect_server_ready, KillHandle, LogLine, SandboxHost, ServerReady, SpawnedProcess};

/// Exit code reported by a scripted process that was killed.
pub const KILLED_EXIT_CODE: i64 = 143;

/// Scripted behaviour for one spawned process.
#[derive(Debug, Clone)]
pub struct MockProcess {
    pub lines: Vec<LogLine>,
    pub exit_code: i64,
    /// Keep running (output open) until killed
    pub keep_running: bool,
}

impl MockProcess {
    /// A process that prints its lines and exits with `code`.
    pub fn exit(code: i64) -> Self {
        Self {
            lines: Vec::new(),
            exit_code: code,
            keep_running: false,
        }
    }

    /// A long-lived process, such as a dev server.
    pub fn running() -> Self {
        Self {
            lines: Vec::new(),
            exit_code: KILLED_EXIT_CODE,
            keep_running: true,
        }
    }

    pub fn stdout(mut self, line: impl Into<String>) -> Self {
        self.lines.push(LogLine::stdout(line));
        self
    }

    pub fn stderr(mut self, line: impl Into<String>) -> Self {
        self.lines.push(LogLine::stderr(line));
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub command: Option<String>,
    pub path: Option<String>,
    pub content: Option<String>,
}

impl CapturedCall {
    fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            command: None,
            path: None,
            content: None,
        }
    }
}

struct LiveProcess {
    id: String,
    command: String,
    output: mpsc::UnboundedSender<LogLine>,
}

/// Mock sandbox host.
#[derive(Clone)]
pub struct MockHost {
    available: Arc<RwLock<bool>>,
    scripts: Arc<RwLock<HashMap<String, VecDeque<MockProcess>>>>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    files: Arc<RwLock<BTreeMap<String, String>>>,
    dirs: Arc<RwLock<BTreeSet<String>>>,
    live: Arc<RwLock<Vec<LiveProcess>>>,
    killed: Arc<RwLock<Vec<String>>>,
    server_ready: broadcast::Sender<ServerReady>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        let (server_ready, _) = broadcast::channel(16);
        Self {
            available: Arc::new(RwLock::new(true)),
            scripts: Arc::new(RwLock::new(HashMap::new())),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            files: Arc::new(RwLock::new(BTreeMap::new())),
            dirs: Arc::new(RwLock::new(BTreeSet::new())),
            live: Arc::new(RwLock::new(Vec::new())),
            killed: Arc::new(RwLock::new(Vec::new())),
            server_ready,
        }
    }

    /// Set whether the host can be used at all.
    pub fn set_available(self, available: bool) -> Self {
        *self.available.write() = available;
        self
    }

    /// Queue the behaviour of the next spawn of `command_line`.
    ///
    /// Scripts are consumed in order; the last one repeats. Unscripted
    /// commands exit 0 without output.
    pub fn on_command(self, command_line: impl Into<String>, process: MockProcess) -> Self {
        self.scripts
            .write()
            .entry(command_line.into())
            .or_default()
            .push_back(process);
        self
    }

    /// Print a line on a running process whose command line matches.
    pub fn emit_output(&self, command_line: &str, line: LogLine) -> bool {
        self.live
            .read()
            .iter()
            .filter(|p| p.command == command_line)
            .any(|p| p.output.send(line.clone()).is_ok())
    }

    /// Announce a server as ready.
    pub fn emit_server_ready(&self, url: impl Into<String>) {
        let url = url.into();
        let ready = detect_server_ready(&url).unwrap_or(ServerReady { port: None, url });
        let _ = self.server_ready.send(ready);
    }

    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    pub fn was_called(&self, method: &str) -> bool {
        self.captured_calls.read().iter().any(|c| c.method == method)
    }

    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Command lines spawned so far, in order.
    pub fn spawned_commands(&self) -> Vec<String> {
        self.get_method_calls("spawn")
            .into_iter()
            .filter_map(|c| c.command)
            .collect()
    }

    pub fn mount_count(&self) -> usize {
        self.get_method_calls("mount").len()
    }

    /// Command lines of processes that were killed.
    pub fn killed_commands(&self) -> Vec<String> {
        self.killed.read().clone()
    }

    /// Command lines of processes still running.
    pub fn running_commands(&self) -> Vec<String> {
        self.live.read().iter().map(|p| p.command.clone()).collect()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        let path = normalize_path(path)?;
        self.files.read().get(&path).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.files.read().clone()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        normalize_path(path).is_some_and(|p| self.dirs.read().contains(&p))
    }

    fn record_call(&self, call: CapturedCall) {
        self.captured_calls.write().push(call);
    }

    fn check_available(&self) -> HostResult<()> {
        if *self.available.read() {
            Ok(())
        } else {
            Err(HostError::Unavailable("mock host disabled".to_string()))
        }
    }

    fn next_process(&self, command_line: &str) -> MockProcess {
        let mut scripts = self.scripts.write();
        match scripts.get_mut(command_line) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| MockProcess::exit(0)),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| MockProcess::exit(0)),
            None => MockProcess::exit(0),
        }
    }

    fn store_file(&self, path: &str, content: &str) -> HostResult<()> {
        let path = normalize_path(path).ok_or_else(|| HostError::InvalidPath(path.to_string()))?;
        self.files.write().insert(path, content.to_string());
        Ok(())
    }
}

#[async_trait]
impl SandboxHost for MockHost {
    async fn mount(&self, tree: &[FileNode]) -> HostResult<()> {
        self.record_call(CapturedCall::new("mount"));
        self.check_available()?;

        for node in walk(tree) {
            if node.is_folder() {
                self.dirs.write().insert(node.path.clone());
            } else {
                self.store_file(&node.path, node.content_str())?;
            }
        }
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> HostResult<SpawnedProcess> {
        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.record_call(CapturedCall {
            command: Some(command_line.clone()),
            ..CapturedCall::new("spawn")
        });
        self.check_available()?;

        let script = self.next_process(&command_line);
        let exit_code = script.exit_code;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill, kill_rx) = KillHandle::new();

        for line in script.lines {
            let _ = out_tx.send(line);
        }
        let process = SpawnedProcess::new(command_line.clone(), out_rx, exit_rx, kill);

        if script.keep_running {
            self.live.write().push(LiveProcess {
                id: process.id.clone(),
                command: command_line.clone(),
                output: out_tx,
            });
            let live = Arc::clone(&self.live);
            let killed = Arc::clone(&self.killed);
            let id = process.id.clone();
            tokio::spawn(async move {
                if kill_rx.await.is_ok() {
                    killed.write().push(command_line);
                }
                live.write().retain(|p| p.id != id);
                let _ = exit_tx.send(exit_code);
            });
        } else {
            drop(out_tx);
            let _ = exit_tx.send(exit_code);
        }

        Ok(process)
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> HostResult<()> {
        self.record_call(CapturedCall {
            path: Some(path.to_string()),
            ..CapturedCall::new("mkdir")
        });
        self.check_available()?;

        let path = normalize_path(path).ok_or_else(|| HostError::InvalidPath(path.to_string()))?;
        let mut dirs = self.dirs.write();
        if recursive {
            let mut prefix = String::new();
            for segment in path.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                dirs.insert(prefix.clone());
            }
        } else {
            dirs.insert(path);
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> HostResult<()> {
        self.record_call(CapturedCall {
            path: Some(path.to_string()),
            content: Some(content.to_string()),
            ..CapturedCall::new("write_file")
        });
        self.check_available()?;
        self.store_file(path, content)
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.server_ready.subscribe()
    }
}
