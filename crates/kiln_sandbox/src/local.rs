//! Sandbox host backed by a directory on the local machine.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use kiln_artifact::{walk, FileNode};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};
use crate::host::{detect_server_ready, KillHandle, LogLine, LogStream, SandboxHost, ServerReady, SpawnedProcess};

/// Runs everything inside a root directory with `tokio::process`.
///
/// Server readiness is inferred from local URLs printed by the process.
pub struct LocalHost {
    root: PathBuf,
    server_ready: broadcast::Sender<ServerReady>,
}

impl LocalHost {
    /// Use `root` as the sandbox root, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> HostResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| HostError::Unavailable(format!("{}: {}", root.display(), e)))?;
        info!("Sandbox root: {}", root.display());

        let (server_ready, _) = broadcast::channel(16);
        Ok(Self { root, server_ready })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox path onto the root, rejecting anything that escapes it.
    pub fn resolve(&self, path: &str) -> HostResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(HostError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl SandboxHost for LocalHost {
    async fn mount(&self, tree: &[FileNode]) -> HostResult<()> {
        debug!("Mounting tree into {}", self.root.display());
        for node in walk(tree) {
            let target = self.resolve(&node.path)?;
            let result = if node.is_folder() {
                tokio::fs::create_dir_all(&target).await
            } else {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| HostError::MountFailed(format!("{}: {}", node.path, e)))?;
                }
                tokio::fs::write(&target, node.content_str()).await
            };
            result.map_err(|e| HostError::MountFailed(format!("{}: {}", node.path, e)))?;
        }
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> HostResult<SpawnedProcess> {
        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Executing: {}", command_line);

        let mut child = Command::new(command)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::SpawnFailed {
                command: command_line.clone(),
                message: e.to_string(),
            })?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill, kill_rx) = KillHandle::new();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, out_tx.clone(), self.server_ready.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, out_tx.clone(), self.server_ready.clone()));
        }
        drop(out_tx);

        let label = command_line.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    debug!("Killing: {}", label);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", label, e);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code().map(i64::from).unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to wait for {}: {}", label, e);
                    -1
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess::new(command_line, out_rx, exit_rx, kill))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> HostResult<()> {
        let target = self.resolve(path)?;
        if recursive {
            tokio::fs::create_dir_all(&target).await?;
        } else if !target.is_dir() {
            tokio::fs::create_dir(&target).await?;
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> HostResult<()> {
        let target = self.resolve(path)?;
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.server_ready.subscribe()
    }
}

async fn forward_lines<R>(
    reader: R,
    stream: LogStream,
    output: mpsc::UnboundedSender<LogLine>,
    server_ready: broadcast::Sender<ServerReady>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut announced = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let message = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if !announced {
                    if let Some(ready) = detect_server_ready(&message) {
                        announced = true;
                        let _ = server_ready.send(ready);
                    }
                }
                let _ = output.send(LogLine {
                    timestamp: Utc::now(),
                    stream,
                    message,
                });
            }
            Err(e) => {
                warn!("Error reading {}: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let host = LocalHost::new(temp.path()).unwrap();

        assert_eq!(host.resolve("/src/App.tsx").unwrap(), temp.path().join("src/App.tsx"));
        assert_eq!(host.resolve("./a/./b").unwrap(), temp.path().join("a/b"));
        assert!(matches!(host.resolve("../etc/passwd"), Err(HostError::InvalidPath(_))));
        assert!(matches!(host.resolve("src/../../x"), Err(HostError::InvalidPath(_))));
    }
}
