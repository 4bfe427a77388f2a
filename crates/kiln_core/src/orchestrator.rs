//! Sandbox orchestration.
//!
//! Drives one boot cycle at a time: mount the tree, install dependencies,
//! start the dev server, then keep the sandbox in sync with later tree
//! changes. Failures are handed to the [`FailureMonitor`], which decides
//! whether a regeneration may run.

use std::collections::VecDeque;
use std::sync::Arc;

use kiln_artifact::{find_root_file, walk, FileNode};
use kiln_sandbox::{
    CommandSpec, HostError, KillHandle, LogLine, SandboxConfig, SandboxHost, ServerReady, SpawnedProcess,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::monitor::{FailureMonitor, RecoveryTrigger, SuppressReason, Verdict};

/// Install output lines kept as context for a failed install.
const INSTALL_CONTEXT_LINES: usize = 20;

/// Phase of the current boot cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootPhase {
    #[default]
    Idle,
    Mounting,
    Installing,
    InstallFailed,
    Running,
    ErrorDetected,
    Regenerating,
    HostUnavailable,
}

impl std::fmt::Display for BootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Mounting => "mounting",
            Self::Installing => "installing",
            Self::InstallFailed => "install failed",
            Self::Running => "running",
            Self::ErrorDetected => "error detected",
            Self::Regenerating => "regenerating",
            Self::HostUnavailable => "host unavailable",
        };
        write!(f, "{}", label)
    }
}

/// Boot state machine.
///
/// `has_mounted` keeps the boot to once per cycle; `has_dev_started` gates
/// incremental sync. Both are cleared only by a regeneration.
#[derive(Debug, Clone, Default)]
pub struct BootState {
    phase: BootPhase,
    has_mounted: bool,
    has_dev_started: bool,
    last_manifest: Option<String>,
    preview_url: Option<String>,
    cycle: u32,
}

impl BootState {
    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    pub fn has_mounted(&self) -> bool {
        self.has_mounted
    }

    pub fn has_dev_started(&self) -> bool {
        self.has_dev_started
    }

    pub fn preview_url(&self) -> Option<&str> {
        self.preview_url.as_deref()
    }

    pub fn last_manifest(&self) -> Option<&str> {
        self.last_manifest.as_deref()
    }

    /// Number of boot cycles started.
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Whether a tree with or without a manifest should boot now.
    pub fn should_boot(&self, has_manifest: bool, generating: bool) -> bool {
        self.phase == BootPhase::Idle && !self.has_mounted && has_manifest && !generating
    }

    pub fn begin_mount(&mut self) -> CoreResult<()> {
        self.transition(&[BootPhase::Idle], BootPhase::Mounting)?;
        self.has_mounted = true;
        self.cycle += 1;
        Ok(())
    }

    pub fn mounted(&mut self) -> CoreResult<()> {
        self.transition(&[BootPhase::Mounting], BootPhase::Installing)
    }

    /// Record the install result. The manifest snapshot is kept only on success.
    pub fn install_exited(&mut self, exit_code: i64, manifest: Option<String>) -> CoreResult<()> {
        if exit_code == 0 {
            self.transition(&[BootPhase::Installing], BootPhase::Running)?;
            self.last_manifest = manifest;
        } else {
            self.transition(&[BootPhase::Installing], BootPhase::InstallFailed)?;
        }
        Ok(())
    }

    pub fn dev_started(&mut self) {
        self.has_dev_started = true;
    }

    pub fn error_detected(&mut self) -> CoreResult<()> {
        self.transition(&[BootPhase::Running], BootPhase::ErrorDetected)
    }

    pub fn set_manifest(&mut self, manifest: String) {
        self.last_manifest = Some(manifest);
    }

    pub fn set_preview_url(&mut self, url: Option<String>) {
        self.preview_url = url;
    }

    /// Clear the cycle flags ahead of a regeneration.
    pub fn begin_regeneration(&mut self) {
        self.has_mounted = false;
        self.has_dev_started = false;
        self.preview_url = None;
        if self.phase != BootPhase::HostUnavailable {
            self.phase = BootPhase::Regenerating;
        }
    }

    /// Regeneration done: the next tree change may boot again.
    pub fn rearm(&mut self) {
        if self.phase != BootPhase::HostUnavailable {
            self.phase = BootPhase::Idle;
        }
    }

    pub fn host_unavailable(&mut self) {
        self.phase = BootPhase::HostUnavailable;
        self.has_dev_started = false;
    }

    fn transition(&mut self, from: &[BootPhase], to: BootPhase) -> CoreResult<()> {
        if !from.contains(&self.phase) {
            return Err(CoreError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Boot phase {} -> {}", self.phase, to);
        self.phase = to;
        Ok(())
    }
}

/// Which sandbox process produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Install,
    Dev,
}

/// Notifications published by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Log { source: ProcessKind, line: LogLine },
    PhaseChanged { phase: BootPhase },
    PreviewReady { url: String },
    Synced { entries: usize, reinstalled: bool },
    DevExited { code: i64 },
    RecoverySuppressed { reason: SuppressReason, detail: String },
    HostError { message: String },
}

/// Channels of a running dev server, driven by the engine.
#[derive(Debug)]
pub struct DevServer {
    pub output: mpsc::UnboundedReceiver<LogLine>,
    pub exit: oneshot::Receiver<i64>,
}

/// Result of handing a tree change to the orchestrator.
#[derive(Debug)]
pub enum TreeOutcome {
    /// Nothing to do yet
    Skipped,
    /// Boot completed and the dev server is running
    Started(DevServer),
    /// Incremental sync into a running sandbox
    Synced,
    /// Boot failed and a regeneration should run
    Recover(RecoveryTrigger),
    /// Boot failed and automatic recovery was suppressed
    Stopped,
    HostUnavailable,
}

pub struct Orchestrator {
    host: Arc<dyn SandboxHost>,
    config: SandboxConfig,
    monitor: FailureMonitor,
    state: BootState,
    events: mpsc::UnboundedSender<SandboxEvent>,
    dev_kill: Option<KillHandle>,
}

impl Orchestrator {
    pub fn new(
        host: Arc<dyn SandboxHost>,
        config: SandboxConfig,
        events: mpsc::UnboundedSender<SandboxEvent>,
    ) -> Self {
        Self {
            host,
            config,
            monitor: FailureMonitor::default(),
            state: BootState::default(),
            events,
            dev_kill: None,
        }
    }

    pub fn with_monitor(mut self, monitor: FailureMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn state(&self) -> &BootState {
        &self.state
    }

    pub fn monitor(&self) -> &FailureMonitor {
        &self.monitor
    }

    pub fn host(&self) -> &Arc<dyn SandboxHost> {
        &self.host
    }

    /// React to a new tree: boot once per cycle, or sync into a running sandbox.
    pub async fn on_tree_changed(&mut self, tree: &[FileNode], generating: bool) -> CoreResult<TreeOutcome> {
        if self.state.phase() == BootPhase::HostUnavailable {
            return Ok(TreeOutcome::HostUnavailable);
        }
        if self.state.has_dev_started() && !generating {
            return self.sync(tree).await;
        }
        let has_manifest = find_root_file(tree, &self.config.manifest_file).is_some();
        if self.state.should_boot(has_manifest, generating) {
            return self.boot(tree).await;
        }
        Ok(TreeOutcome::Skipped)
    }

    /// Mount, install and start the dev server.
    pub async fn boot(&mut self, tree: &[FileNode]) -> CoreResult<TreeOutcome> {
        self.monitor.begin_cycle();
        self.state.begin_mount()?;
        self.publish_phase();
        info!("Boot cycle {}: mounting {} top-level entries", self.state.cycle(), tree.len());

        if let Err(e) = self.host.mount(tree).await {
            return self.host_failed(e);
        }
        self.state.mounted()?;
        self.publish_phase();

        let manifest = find_root_file(tree, &self.config.manifest_file).map(|n| n.content_str().to_string());
        let install = self.config.install.clone();
        let (exit_code, output) = match self.run_install(&install).await {
            Ok(result) => result,
            Err(e) => return self.host_failed(e),
        };

        self.state.install_exited(exit_code, manifest)?;
        self.publish_phase();

        if exit_code != 0 {
            warn!("Installation failed with exit code {}. Triggering auto-regeneration...", exit_code);
            let context: Vec<String> = output.into_iter().collect();
            return Ok(match self.monitor.install_failed(exit_code, &context) {
                Some(Verdict::Recover(trigger)) => TreeOutcome::Recover(trigger),
                Some(Verdict::Suppressed { reason, trigger }) => {
                    self.publish_suppressed(reason, &trigger);
                    TreeOutcome::Stopped
                }
                None => TreeOutcome::Stopped,
            });
        }

        let dev = self.config.dev.clone();
        info!("Starting dev server: {}", dev);
        let process = match self.host.spawn(&dev.program, &dev.args).await {
            Ok(process) => process,
            Err(e) => return self.host_failed(e),
        };
        let (output, exit, kill) = process.into_parts();
        self.dev_kill = Some(kill);
        self.state.dev_started();

        Ok(TreeOutcome::Started(DevServer { output, exit }))
    }

    /// Write the tree into the running sandbox, reinstalling if the manifest changed.
    pub async fn sync(&mut self, tree: &[FileNode]) -> CoreResult<TreeOutcome> {
        let mut entries = 0;
        for node in walk(tree) {
            let result = if node.is_folder() {
                self.host.mkdir(&node.path, true).await
            } else {
                self.host.write_file(&node.path, node.content_str()).await
            };
            if let Err(e) = result {
                return self.host_failed(e);
            }
            entries += 1;
        }

        let mut reinstalled = false;
        if let Some(manifest) = find_root_file(tree, &self.config.manifest_file) {
            let content = manifest.content_str();
            if self.state.last_manifest() != Some(content) {
                info!("{} changed. Re-installing dependencies...", self.config.manifest_file);
                self.state.set_manifest(content.to_string());
                let install = self.config.install.clone();
                match self.run_install(&install).await {
                    Ok((0, _)) => {}
                    Ok((code, _)) => warn!("Re-install exited with code {}", code),
                    Err(e) => return self.host_failed(e),
                }
                reinstalled = true;
            }
        }

        debug!("Synced {} entries", entries);
        self.publish(SandboxEvent::Synced { entries, reinstalled });
        Ok(TreeOutcome::Synced)
    }

    /// Feed one dev-server line to the monitor.
    ///
    /// Returns a trigger when the line should lead to a regeneration.
    pub fn observe_dev_line(&mut self, line: LogLine) -> CoreResult<Option<RecoveryTrigger>> {
        let verdict = if self.state.phase() == BootPhase::Running {
            self.monitor.observe_line(&line.message)
        } else {
            None
        };
        self.publish(SandboxEvent::Log {
            source: ProcessKind::Dev,
            line,
        });

        match verdict {
            Some(Verdict::Recover(trigger)) => {
                warn!("Runtime error detected: {}", trigger.signature);
                self.state.error_detected()?;
                self.publish_phase();
                Ok(Some(trigger))
            }
            Some(Verdict::Suppressed { reason, trigger }) => {
                self.publish_suppressed(reason, &trigger);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Accept a server-ready notice from the current dev server.
    ///
    /// Returns the preview URL when it was accepted.
    pub fn on_server_ready(&mut self, ready: ServerReady) -> Option<String> {
        if !self.state.has_dev_started() {
            debug!("Ignoring server-ready outside a running cycle: {}", ready.url);
            return None;
        }
        info!("Preview ready at {}", ready.url);
        self.state.set_preview_url(Some(ready.url.clone()));
        self.publish(SandboxEvent::PreviewReady { url: ready.url.clone() });
        Some(ready.url)
    }

    pub fn on_dev_exited(&mut self, code: i64) {
        if code == 0 {
            info!("Dev server exited");
        } else {
            warn!("Dev server exited with code {}", code);
        }
        self.dev_kill = None;
        self.publish(SandboxEvent::DevExited { code });
    }

    /// Stop the dev server and clear the cycle ahead of a regeneration.
    pub fn begin_regeneration(&mut self, manual: bool) {
        if manual {
            self.monitor.reset_budget();
        }
        self.stop_dev();
        self.state.begin_regeneration();
        self.publish_phase();
    }

    pub fn finish_regeneration(&mut self) {
        self.state.rearm();
        self.publish_phase();
    }

    /// Kill the dev server, if one is running.
    pub fn stop_dev(&mut self) {
        if let Some(kill) = self.dev_kill.take() {
            if kill.kill() {
                info!("Stopped dev server");
            }
        }
    }

    async fn run_install(&self, install: &CommandSpec) -> Result<(i64, VecDeque<String>), HostError> {
        info!("Running {}", install);
        let process: SpawnedProcess = self.host.spawn(&install.program, &install.args).await?;

        let events = self.events.clone();
        let mut context = VecDeque::with_capacity(INSTALL_CONTEXT_LINES);
        let code = process
            .wait_with_output(|line| {
                if context.len() == INSTALL_CONTEXT_LINES {
                    context.pop_front();
                }
                context.push_back(line.message.clone());
                let _ = events.send(SandboxEvent::Log {
                    source: ProcessKind::Install,
                    line,
                });
            })
            .await?;
        Ok((code, context))
    }

    fn host_failed(&mut self, err: HostError) -> CoreResult<TreeOutcome> {
        if err.is_unavailable() {
            error!("Sandbox host unavailable: {}", err);
            self.stop_dev();
            self.state.host_unavailable();
            self.publish_phase();
            self.publish(SandboxEvent::HostError {
                message: err.to_string(),
            });
            return Ok(TreeOutcome::HostUnavailable);
        }
        self.publish(SandboxEvent::HostError {
            message: err.to_string(),
        });
        Err(err.into())
    }

    fn publish_suppressed(&self, reason: SuppressReason, trigger: &RecoveryTrigger) {
        self.publish(SandboxEvent::RecoverySuppressed {
            reason,
            detail: trigger.signature.clone(),
        });
    }

    fn publish_phase(&self) {
        self.publish(SandboxEvent::PhaseChanged {
            phase: self.state.phase(),
        });
    }

    fn publish(&self, event: SandboxEvent) {
        let _ = self.events.send(event);
    }
}
