//! Session engine.
//!
//! A single task that owns the session controller and the orchestrator and
//! multiplexes user commands, dev-server output, server-ready notices and
//! the recovery debounce. Nothing else mutates steps, tree or boot state.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use kiln_chat::{
    ChatError, GenerationOutcome, GenerationRequest, GenerationSession, PreparedGeneration, ResumeAction,
    SessionController,
};
use kiln_sandbox::{LogLine, ServerReady};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::monitor::RecoveryTrigger;
use crate::orchestrator::{DevServer, Orchestrator, TreeOutcome};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Commands accepted while the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// User-initiated regeneration; resets the recovery budget
    Regenerate { instruction: String },
    EditFile { path: String, content: String },
    Shutdown,
}

/// How the engine should start.
#[derive(Debug, Clone)]
pub enum EngineStart {
    Generate(GenerationRequest),
    /// Restore a saved session or restart an unfinished request
    Resume,
}

/// Cloneable sender for [`EngineCommand`]s.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn regenerate(&self, instruction: impl Into<String>) -> CoreResult<()> {
        self.send(EngineCommand::Regenerate {
            instruction: instruction.into(),
        })
    }

    pub fn edit_file(&self, path: impl Into<String>, content: impl Into<String>) -> CoreResult<()> {
        self.send(EngineCommand::EditFile {
            path: path.into(),
            content: content.into(),
        })
    }

    pub fn shutdown(&self) -> CoreResult<()> {
        self.send(EngineCommand::Shutdown)
    }

    fn send(&self, command: EngineCommand) -> CoreResult<()> {
        self.commands.send(command).map_err(|_| CoreError::EngineStopped)
    }
}

struct PendingRecovery {
    trigger: RecoveryTrigger,
    deadline: Instant,
}

pub struct Engine {
    controller: SessionController,
    orchestrator: Orchestrator,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    server_ready: broadcast::Receiver<ServerReady>,
    dev: Option<DevServer>,
    pending: Option<PendingRecovery>,
    debounce: Duration,
    /// Commands received while a generation was streaming
    deferred: VecDeque<EngineCommand>,
    stopping: bool,
}

impl Engine {
    pub fn new(controller: SessionController, orchestrator: Orchestrator) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server_ready = orchestrator.host().subscribe_server_ready();
        let engine = Self {
            controller,
            orchestrator,
            commands: rx,
            server_ready,
            dev: None,
            pending: None,
            debounce: DEFAULT_DEBOUNCE,
            deferred: VecDeque::new(),
            stopping: false,
        };
        (engine, EngineHandle { commands: tx })
    }

    /// Quiet period between a runtime error and its regeneration.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run until shutdown. Returns the final session state.
    pub async fn run(mut self, start: EngineStart) -> CoreResult<GenerationSession> {
        let prepared = match start {
            EngineStart::Generate(request) => Some(self.controller.prepare_initial(request)?),
            EngineStart::Resume => match self.controller.resume()? {
                ResumeAction::Restored { steps } => {
                    info!("Resumed session with {} steps", steps);
                    None
                }
                ResumeAction::Restart(prepared) => Some(prepared),
            },
        };
        if let Some(prepared) = prepared {
            self.generate(prepared).await;
        }
        if !self.stopping {
            self.apply_tree().await;
        }

        let mut ready_open = true;
        while !self.stopping {
            if let Some(command) = self.deferred.pop_front() {
                self.handle(command).await;
                continue;
            }
            let deadline = self.pending.as_ref().map(|p| p.deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                line = next_line(&mut self.dev), if self.dev.is_some() => match line {
                    Some(line) => {
                        if let Some(trigger) = self.orchestrator.observe_dev_line(line)? {
                            self.schedule(trigger);
                        }
                    }
                    None => self.dev_closed().await,
                },
                ready = self.server_ready.recv(), if ready_open => match ready {
                    Ok(ready) => {
                        if let Some(url) = self.orchestrator.on_server_ready(ready) {
                            self.controller.set_preview_url(Some(url));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} server-ready notices", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => ready_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(pending) = self.pending.take() {
                        info!("Regenerating to fix: {}", pending.trigger.signature);
                        self.regenerate(&pending.trigger.instruction, false).await;
                    }
                }
            }
        }

        info!("Shutting down engine");
        self.orchestrator.stop_dev();
        Ok(self.controller.session().clone())
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Regenerate { instruction } => self.regenerate(&instruction, true).await,
            EngineCommand::EditFile { path, content } => self.edit_file(&path, &content).await,
            EngineCommand::Shutdown => self.stopping = true,
        }
    }

    /// A regeneration that cannot start is reported as a failed generation;
    /// the engine keeps running either way.
    async fn regenerate(&mut self, instruction: &str, manual: bool) {
        let prepared = match self.controller.prepare_regeneration(instruction) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Could not start regeneration");
                self.controller.fail(e);
                return;
            }
        };

        self.pending = None;
        self.dev = None;
        self.orchestrator.begin_regeneration(manual);
        self.controller.set_preview_url(None);

        match self.generate(prepared).await {
            GenerationOutcome::Completed { steps } => debug!("Regeneration produced {} steps", steps),
            GenerationOutcome::Failed { message } => warn!("Regeneration failed: {}", message),
        }

        self.orchestrator.finish_regeneration();
        if !self.stopping {
            self.apply_tree().await;
        }
    }

    /// Stream one generation to the end.
    ///
    /// Shutdown interrupts the stream and leaves the request pending for a
    /// later resume. Other commands wait until the stream is done.
    async fn generate(&mut self, prepared: PreparedGeneration) -> GenerationOutcome {
        self.controller.begin(&prepared);

        let opened = tokio::select! {
            opened = self.controller.open(&prepared) => opened,
            () = until_shutdown(&mut self.commands, &mut self.deferred) => return self.interrupt(),
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.controller.fail(e),
        };

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        self.controller.apply_chunk(&chunk);
                    }
                    Some(Err(e)) => return self.controller.fail(e),
                    None => return self.controller.finish(),
                },
                () = until_shutdown(&mut self.commands, &mut self.deferred) => return self.interrupt(),
            }
        }
    }

    fn interrupt(&mut self) -> GenerationOutcome {
        info!("Shutdown requested while streaming");
        self.stopping = true;
        self.controller
            .fail(ChatError::StreamError("interrupted by shutdown".to_string()))
    }

    async fn edit_file(&mut self, path: &str, content: &str) {
        if self.controller.edit_file(path, content) {
            self.apply_tree().await;
        } else {
            warn!("Ignoring edit of unknown file {}", path);
        }
    }

    async fn apply_tree(&mut self) {
        let generating = self.controller.is_generating();
        let outcome = self
            .orchestrator
            .on_tree_changed(self.controller.file_tree(), generating)
            .await;

        match outcome {
            Ok(TreeOutcome::Started(dev)) => self.dev = Some(dev),
            Ok(TreeOutcome::Recover(trigger)) => self.schedule(trigger),
            Ok(_) => {}
            Err(e) => error!("Sandbox update failed: {}", e),
        }
    }

    fn schedule(&mut self, trigger: RecoveryTrigger) {
        let delay = if trigger.is_debounced() {
            self.debounce
        } else {
            Duration::ZERO
        };
        debug!("Recovery scheduled in {:?}", delay);
        self.pending = Some(PendingRecovery {
            trigger,
            deadline: Instant::now() + delay,
        });
    }

    async fn dev_closed(&mut self) {
        if let Some(dev) = self.dev.take() {
            let code = dev.exit.await.unwrap_or(-1);
            self.orchestrator.on_dev_exited(code);
        }
    }
}

/// Resolve on a shutdown request, queueing anything else that arrives.
///
/// A closed command channel is not a shutdown request here; the main loop
/// notices it once the stream is done.
async fn until_shutdown(commands: &mut mpsc::UnboundedReceiver<EngineCommand>, deferred: &mut VecDeque<EngineCommand>) {
    loop {
        match commands.recv().await {
            Some(EngineCommand::Shutdown) => return,
            Some(command) => {
                debug!("Deferring {:?} until the stream ends", command);
                deferred.push_back(command);
            }
            None => std::future::pending::<()>().await,
        }
    }
}

async fn next_line(dev: &mut Option<DevServer>) -> Option<LogLine> {
    match dev {
        Some(dev) => dev.output.recv().await,
        None => None,
    }
}
