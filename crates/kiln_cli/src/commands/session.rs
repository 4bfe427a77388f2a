//! Shared session runner for `generate` and `resume`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use kiln_artifact::file_count;
use kiln_chat::{
    GenerationOutcome, LlmAdapter, LlmProvider, ResumeAction, SessionController, SessionEvent, SessionStore,
};
use kiln_core::{Engine, EngineHandle, EngineStart, KilnConfig, Orchestrator, ProcessKind, SandboxEvent};
use kiln_sandbox::{LocalHost, SandboxHost};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How long Ctrl-C waits for the engine before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Workspace holding the `.kiln` state directory
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Directory the sandbox runs in (default: <workspace>/.kiln/sandbox)
    #[arg(long)]
    pub sandbox_dir: Option<PathBuf>,

    /// LLM provider: openai, anthropic or relay
    #[arg(long, env = "KILN_LLM_PROVIDER")]
    pub provider: Option<String>,

    /// Model override
    #[arg(short, long)]
    pub model: Option<String>,

    /// Only write the generated files; do not install or run them
    #[arg(long)]
    pub no_run: bool,
}

impl SessionArgs {
    fn sandbox_dir(&self) -> PathBuf {
        self.sandbox_dir
            .clone()
            .unwrap_or_else(|| self.workspace.join(".kiln").join("sandbox"))
    }
}

/// A line typed while the session runs.
#[derive(Debug, PartialEq, Eq)]
pub enum InputCommand {
    Regenerate(String),
    Edit { path: String, source: PathBuf },
    Quit,
}

pub fn parse_input(line: &str) -> Option<InputCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "/quit" || line == "/exit" {
        return Some(InputCommand::Quit);
    }
    if let Some(rest) = line.strip_prefix("/edit ") {
        let mut parts = rest.split_whitespace();
        let (Some(path), Some(source)) = (parts.next(), parts.next()) else {
            return None;
        };
        return Some(InputCommand::Edit {
            path: path.to_string(),
            source: PathBuf::from(source),
        });
    }
    if line.starts_with('/') {
        return None;
    }
    Some(InputCommand::Regenerate(line.to_string()))
}

/// Run a session until the user quits or presses Ctrl-C.
pub async fn run_session(args: SessionArgs, start: EngineStart, quiet: bool) -> Result<()> {
    let config = KilnConfig::load(&args.workspace).context("Failed to load .kiln/config.toml")?;

    let source = primary_source(&args.provider, args.model.clone(), &args.workspace)?;
    info!("Using {} ({})", source.provider(), source.model());

    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let mut controller =
        SessionController::new(Arc::new(source), SessionStore::new(&args.workspace), session_tx)
            .with_first_chunk_timeout(config.generation.first_chunk_timeout());
    if let Some(name) = &config.generation.fallback_provider {
        let provider = LlmProvider::parse(name).ok_or_else(|| anyhow!("Unknown provider: {}", name))?;
        match LlmAdapter::for_provider(&provider, None) {
            Ok(fallback) => controller = controller.with_fallback(Arc::new(fallback)),
            Err(e) => warn!("Fallback provider {} not available: {}", name, e),
        }
    }
    tokio::spawn(print_session_events(session_rx));

    let host = LocalHost::new(args.sandbox_dir())?;
    if args.no_run {
        return generate_only(controller, host, start).await;
    }

    let (sandbox_tx, sandbox_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(Arc::new(host), config.sandbox.clone(), sandbox_tx)
        .with_monitor(config.monitor.build_monitor());
    let (engine, handle) = Engine::new(controller, orchestrator);
    let engine = engine.with_debounce(config.monitor.debounce());

    tokio::spawn(print_sandbox_events(sandbox_rx, quiet));
    let input = tokio::spawn(read_commands(handle.clone()));
    let mut task = tokio::spawn(engine.run(start));

    let session = tokio::select! {
        joined = &mut task => joined??,
        _ = tokio::signal::ctrl_c() => {
            println!("\n🛑 Stopping...");
            handle.shutdown()?;
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(joined) => joined??,
                Err(_) => {
                    warn!("Engine did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                    task.abort();
                    input.abort();
                    println!("⚠️  Session aborted; run `kiln resume` to continue");
                    return Ok(());
                }
            }
        }
    };
    input.abort();

    println!();
    println!(
        "✅ Session ended with {} steps and {} files",
        session.steps.len(),
        file_count(&session.file_tree)
    );
    Ok(())
}

fn primary_source(provider: &Option<String>, model: Option<String>, workspace: &Path) -> Result<LlmAdapter> {
    let adapter = match provider {
        Some(name) => {
            let provider = LlmProvider::parse(name).ok_or_else(|| anyhow!("Unknown provider: {}", name))?;
            LlmAdapter::for_provider(&provider, model)?
        }
        None => match LlmAdapter::from_settings(workspace) {
            Ok(adapter) => adapter,
            Err(_) => LlmAdapter::from_env()
                .context("No LLM configured. Set OPENAI_API_KEY, ANTHROPIC_API_KEY or KILN_RELAY_URL")?,
        },
    };
    Ok(adapter)
}

async fn generate_only(mut controller: SessionController, host: LocalHost, start: EngineStart) -> Result<()> {
    let prepared = match start {
        EngineStart::Generate(request) => Some(controller.prepare_initial(request)?),
        EngineStart::Resume => match controller.resume()? {
            ResumeAction::Restored { .. } => None,
            ResumeAction::Restart(prepared) => Some(prepared),
        },
    };
    if let Some(prepared) = prepared {
        if let GenerationOutcome::Failed { message } = controller.run(prepared).await {
            bail!("Generation failed: {}", message);
        }
    }

    host.mount(controller.file_tree()).await?;
    println!(
        "📁 Wrote {} files to {}",
        file_count(controller.file_tree()),
        host.root().display()
    );
    Ok(())
}

async fn read_commands(handle: EngineHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let result = match parse_input(&line) {
            Some(InputCommand::Regenerate(instruction)) => handle.regenerate(instruction),
            Some(InputCommand::Edit { path, source }) => match tokio::fs::read_to_string(&source).await {
                Ok(content) => handle.edit_file(path, content),
                Err(e) => {
                    eprintln!("⚠️  Cannot read {}: {}", source.display(), e);
                    continue;
                }
            },
            Some(InputCommand::Quit) => handle.shutdown(),
            None => continue,
        };
        if result.is_err() {
            break;
        }
    }
}

async fn print_session_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Status { status } => println!("⏳ {}", status),
            SessionEvent::ActiveFileChanged { path } => println!("📄 {}", path),
            SessionEvent::FallbackEngaged { source } => println!("↪️  Falling back to {}", source),
            SessionEvent::Finished { steps } => println!("✅ Generated {} steps", steps),
            SessionEvent::Failed { message } => println!("❌ Generation failed: {}", message),
            SessionEvent::StepsUpdated { .. } => {}
        }
    }
}

async fn print_sandbox_events(mut events: mpsc::UnboundedReceiver<SandboxEvent>, quiet: bool) {
    while let Some(event) = events.recv().await {
        match event {
            SandboxEvent::Log { source, line } => {
                if !quiet {
                    let tag = match source {
                        ProcessKind::Install => "install",
                        ProcessKind::Dev => "dev",
                    };
                    println!("   [{}] {}", tag, line.message);
                }
            }
            SandboxEvent::PhaseChanged { phase } => println!("🔧 Sandbox: {}", phase),
            SandboxEvent::PreviewReady { url } => println!("🌐 Preview: {}", url),
            SandboxEvent::DevExited { code } => println!("⏹️  Dev server exited ({})", code),
            SandboxEvent::RecoverySuppressed { reason, detail } => {
                println!("⚠️  Not regenerating automatically ({:?}): {}", reason, detail);
                println!("   Type an instruction to try again.");
            }
            SandboxEvent::HostError { message } => eprintln!("❌ Sandbox: {}", message),
            SandboxEvent::Synced { .. } => {}
        }
    }
}
