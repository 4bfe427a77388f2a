//! Engine tests against a mock sandbox and a scripted source.

use std::sync::Arc;
use std::time::Duration;

use kiln_chat::{GenerationRequest, GenerationStatus, ScriptedReply, ScriptedSource, SessionController, SessionEvent, SessionStore};
use kiln_core::{
    BootPhase, Engine, EngineHandle, EngineStart, FailureMonitor, Orchestrator, ProcessKind, SandboxEvent,
    SuppressReason,
};
use kiln_sandbox::{MockHost, MockProcess, SandboxConfig, SandboxHost};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TODO_APP: &str = r#"<artifact title="Todo App">
<action type="file" path="package.json">{"name": "todo", "scripts": {"dev": "vite"}}</action>
<action type="file" path="src/main.js">console.log("todo");</action>
</artifact>"#;

const TODO_APP_BLUE: &str = r#"<artifact title="Todo App">
<action type="file" path="src/main.js">document.body.style.background = "blue";</action>
</artifact>"#;

struct Harness {
    _temp: TempDir,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    events: mpsc::UnboundedReceiver<SandboxEvent>,
    handle: EngineHandle,
    task: JoinHandle<kiln_core::CoreResult<kiln_chat::GenerationSession>>,
}

fn start(host: &MockHost, source: &ScriptedSource) -> Harness {
    let temp = TempDir::new().unwrap();
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let (sandbox_tx, sandbox_rx) = mpsc::unbounded_channel();

    let controller = SessionController::new(Arc::new(source.clone()), SessionStore::new(temp.path()), session_tx);
    let host: Arc<dyn SandboxHost> = Arc::new(host.clone());
    let orchestrator =
        Orchestrator::new(host, SandboxConfig::default(), sandbox_tx).with_monitor(FailureMonitor::default());
    let (engine, handle) = Engine::new(controller, orchestrator);
    let engine = engine.with_debounce(Duration::from_millis(20));

    let task = tokio::spawn(engine.run(EngineStart::Generate(GenerationRequest::new("todo app"))));
    Harness {
        _temp: temp,
        session_events: session_rx,
        events: sandbox_rx,
        handle,
        task,
    }
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SandboxEvent>,
    matches: impl Fn(&SandboxEvent) -> bool,
) -> SandboxEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sandbox event")
}

fn is_phase(event: &SandboxEvent, expected: BootPhase) -> bool {
    matches!(event, SandboxEvent::PhaseChanged { phase } if *phase == expected)
}

async fn shutdown(harness: Harness) -> kiln_chat::GenerationSession {
    harness.handle.shutdown().unwrap();
    harness.task.await.unwrap().unwrap()
}

#[tokio::test]
async fn test_install_failure_regenerates_once() {
    let host = MockHost::new().on_command("npm install", MockProcess::exit(1).stderr("npm ERR! code ERESOLVE"));
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);

    let event = wait_for(&mut harness.events, |e| matches!(e, SandboxEvent::RecoverySuppressed { .. })).await;
    assert!(matches!(
        event,
        SandboxEvent::RecoverySuppressed {
            reason: SuppressReason::RepeatedError,
            ..
        }
    ));

    shutdown(harness).await;
    assert_eq!(source.request_count(), 2);
    let regeneration = &source.requests()[1];
    assert!(regeneration
        .last_content()
        .unwrap()
        .contains("The previous dependency installation failed"));
    assert!(!host.spawned_commands().contains(&"npm run dev".to_string()));
}

#[tokio::test]
async fn test_runtime_errors_in_one_cycle_regenerate_once() {
    let host = MockHost::new().on_command(
        "npm run dev",
        MockProcess::running()
            .stderr("SyntaxError: Unexpected token '<'")
            .stderr("Uncaught ReferenceError: App is not defined"),
    );
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);

    wait_for(&mut harness.events, |e| matches!(e, SandboxEvent::RecoverySuppressed { .. })).await;
    shutdown(harness).await;

    assert_eq!(source.request_count(), 2);
    assert!(source.requests()[1]
        .last_content()
        .unwrap()
        .contains("I encountered this error during execution: SyntaxError: Unexpected token '<'. Please fix it."));
    assert_eq!(host.mount_count(), 2);
    assert!(host.killed_commands().contains(&"npm run dev".to_string()));
}

#[tokio::test]
async fn test_server_ready_sets_preview_url() {
    let host = MockHost::new().on_command("npm run dev", MockProcess::running());
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);

    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::Running)).await;
    host.emit_server_ready("http://localhost:5173/");
    let event = wait_for(&mut harness.events, |e| matches!(e, SandboxEvent::PreviewReady { .. })).await;
    assert!(matches!(event, SandboxEvent::PreviewReady { url } if url == "http://localhost:5173/"));

    let session = shutdown(harness).await;
    assert_eq!(session.preview_url.as_deref(), Some("http://localhost:5173/"));
    assert_eq!(source.request_count(), 1);
}

#[tokio::test]
async fn test_manifest_edit_syncs_and_reinstalls() {
    let host = MockHost::new()
        .on_command("npm install", MockProcess::exit(0).stdout("added 1 package"))
        .on_command("npm run dev", MockProcess::running());
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);

    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::Running)).await;
    harness
        .handle
        .edit_file("package.json", r#"{"name": "todo", "dependencies": {"lodash": "4"}}"#)
        .unwrap();

    let event = wait_for(&mut harness.events, |e| matches!(e, SandboxEvent::Synced { .. })).await;
    assert!(matches!(event, SandboxEvent::Synced { reinstalled: true, .. }));
    shutdown(harness).await;

    assert_eq!(host.spawned_commands(), vec!["npm install", "npm run dev", "npm install"]);
    assert!(host.file("package.json").unwrap().contains("lodash"));
    assert_eq!(host.mount_count(), 1);
}

#[tokio::test]
async fn test_manual_regeneration_restarts_cycle() {
    let host = MockHost::new().on_command("npm run dev", MockProcess::running());
    let source = ScriptedSource::new("primary")
        .reply(ScriptedReply::text(TODO_APP, 16))
        .reply(ScriptedReply::text(TODO_APP_BLUE, 16));
    let mut harness = start(&host, &source);

    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::Running)).await;
    harness.handle.regenerate("make the background blue").unwrap();
    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::Regenerating)).await;
    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::Running)).await;

    let session = shutdown(harness).await;
    assert_eq!(source.request_count(), 2);
    assert!(source.requests()[1]
        .last_content()
        .unwrap()
        .contains("make the background blue"));
    assert_eq!(host.mount_count(), 2);
    assert!(host.file("src/main.js").unwrap().contains("blue"));
    // earlier steps are kept as the prefix
    assert!(session.steps.len() > 3);
}

#[tokio::test]
async fn test_unavailable_host_stops_booting() {
    let host = MockHost::new().set_available(false);
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);

    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::HostUnavailable)).await;
    let session = shutdown(harness).await;

    assert_eq!(session.file_tree.len(), 2);
    assert!(host.spawned_commands().is_empty());
}

#[tokio::test]
async fn test_install_output_is_published() {
    let host = MockHost::new()
        .on_command("npm install", MockProcess::exit(0).stdout("added 42 packages"))
        .on_command("npm run dev", MockProcess::running().stdout("VITE v5 ready"));
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);

    let install = wait_for(&mut harness.events, |e| {
        matches!(e, SandboxEvent::Log { source: ProcessKind::Install, .. })
    })
    .await;
    assert!(matches!(install, SandboxEvent::Log { line, .. } if line.message == "added 42 packages"));
    wait_for(&mut harness.events, |e| matches!(e, SandboxEvent::Log { source: ProcessKind::Dev, .. })).await;

    shutdown(harness).await;
}

#[tokio::test]
async fn test_shutdown_interrupts_stalled_stream() {
    let host = MockHost::new();
    let source = ScriptedSource::new("primary").reply(ScriptedReply::Stall);
    let harness = start(&host, &source);

    harness.handle.shutdown().unwrap();
    let session = tokio::time::timeout(Duration::from_secs(3), harness.task)
        .await
        .expect("engine kept streaming after shutdown")
        .unwrap()
        .unwrap();

    assert!(!session.generating);
    assert!(matches!(session.status, Some(GenerationStatus::Failed)));
    assert_eq!(host.mount_count(), 0);
    // the request stays pending so the session can be resumed
    assert!(harness._temp.path().join(".kiln/session/request.json").exists());
}

#[tokio::test]
async fn test_regeneration_that_cannot_start_keeps_engine_running() {
    let host = MockHost::new().on_command("npm run dev", MockProcess::running());
    let source = ScriptedSource::new("primary").reply(ScriptedReply::text(TODO_APP, 16));
    let mut harness = start(&host, &source);
    wait_for(&mut harness.events, |e| is_phase(e, BootPhase::Running)).await;

    // a directory in place of the request marker makes saving it fail
    std::fs::create_dir_all(harness._temp.path().join(".kiln/session/request.json")).unwrap();
    harness.handle.regenerate("make the background blue").unwrap();

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match harness.session_events.recv().await {
                Some(SessionEvent::Failed { message }) => return message,
                Some(_) => continue,
                None => panic!("session channel closed"),
            }
        }
    })
    .await
    .expect("regeneration failure was not reported");
    assert!(failed.contains("I/O error"));

    harness
        .handle
        .edit_file("src/main.js", "console.log(\"still here\");")
        .unwrap();
    wait_for(&mut harness.events, |e| matches!(e, SandboxEvent::Synced { .. })).await;

    let session = shutdown(harness).await;
    assert_eq!(source.request_count(), 1);
    assert_eq!(session.steps.len(), 2);
    assert!(host.file("src/main.js").unwrap().contains("still here"));
}
