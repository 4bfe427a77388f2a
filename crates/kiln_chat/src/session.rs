//! Generation session controller.
//!
//! Owns the request/stream lifecycle of one session: it issues the request,
//! feeds every chunk through the artifact parser, rebuilds the file tree,
//! tracks the active file and persists the result. It is the only mutator of
//! steps and tree.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kiln_artifact::{
    build_file_tree, find_file_by_path, find_file_by_path_mut, find_first_file, last_step_id,
    normalize_path, ArtifactParser, FileNode, Step, StepKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, ChatResult};
use crate::llm::{TextSource, TextStream};
use crate::persistence::SessionStore;
use crate::prompts::regeneration_message;
use crate::types::{ChatRequest, GenerationRequest, GenerationStatus, Message};

/// Default wait for the first chunk before switching to the fallback source.
pub const DEFAULT_FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Notifications published while a session runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status { status: GenerationStatus },
    StepsUpdated { count: usize },
    ActiveFileChanged { path: String },
    FallbackEngaged { source: String },
    Finished { steps: usize },
    Failed { message: String },
}

/// Observable state of the current session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationSession {
    pub prompt: String,
    pub steps: Vec<Step>,
    pub file_tree: Vec<FileNode>,
    pub preview_url: Option<String>,
    pub generating: bool,
    pub status: Option<GenerationStatus>,
    pub active_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Initial,
    Regeneration,
}

/// A request ready to be streamed, plus the steps it builds on.
#[derive(Debug, Clone)]
pub struct PreparedGeneration {
    pub kind: GenerationKind,
    pub request: ChatRequest,
    /// Steps that existed when the generation was requested
    pub base_steps: Vec<Step>,
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { steps: usize },
    Failed { message: String },
}

impl GenerationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// What `resume` found on disk.
#[derive(Debug)]
pub enum ResumeAction {
    /// A finished session was restored; nothing to stream
    Restored { steps: usize },
    /// An unfinished request must be streamed again
    Restart(PreparedGeneration),
}

pub struct SessionController {
    source: Arc<dyn TextSource>,
    fallback: Option<Arc<dyn TextSource>>,
    first_chunk_timeout: Duration,
    store: SessionStore,
    events: mpsc::UnboundedSender<SessionEvent>,

    request: GenerationRequest,
    session: GenerationSession,
    base_steps: Vec<Step>,
    parser: ArtifactParser,
    /// Raw text of the most recent stream
    last_response: String,
    receiving: bool,
    /// User edits laid over the projected tree
    edits: BTreeMap<String, String>,
}

impl SessionController {
    pub fn new(
        source: Arc<dyn TextSource>,
        store: SessionStore,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            source,
            fallback: None,
            first_chunk_timeout: DEFAULT_FIRST_CHUNK_TIMEOUT,
            store,
            events,
            request: GenerationRequest {
                prompts: Vec::new(),
                model: None,
            },
            session: GenerationSession::default(),
            base_steps: Vec::new(),
            parser: ArtifactParser::new(),
            last_response: String::new(),
            receiving: false,
            edits: BTreeMap::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn TextSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_first_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.first_chunk_timeout = timeout;
        self
    }

    pub fn session(&self) -> &GenerationSession {
        &self.session
    }

    pub fn steps(&self) -> &[Step] {
        &self.session.steps
    }

    pub fn file_tree(&self) -> &[FileNode] {
        &self.session.file_tree
    }

    pub fn active_path(&self) -> Option<&str> {
        self.session.active_path.as_deref()
    }

    pub fn is_generating(&self) -> bool {
        self.session.generating
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    pub fn set_preview_url(&mut self, url: Option<String>) {
        self.session.preview_url = url;
    }

    /// Start a fresh session from seed prompts.
    pub fn prepare_initial(&mut self, request: GenerationRequest) -> ChatResult<PreparedGeneration> {
        self.store.save_request(&request)?;

        let messages = request.prompts.iter().map(Message::user).collect();
        let chat = ChatRequest::new(messages).model(request.model.clone());

        self.session = GenerationSession {
            prompt: request.headline().to_string(),
            ..GenerationSession::default()
        };
        self.request = request;
        self.last_response.clear();
        self.edits.clear();

        Ok(PreparedGeneration {
            kind: GenerationKind::Initial,
            request: chat,
            base_steps: Vec::new(),
        })
    }

    /// Build a regeneration request on top of the current steps.
    ///
    /// The previous response is resent in full as assistant context and the
    /// instruction is embedded verbatim in the final user message.
    pub fn prepare_regeneration(&mut self, instruction: &str) -> ChatResult<PreparedGeneration> {
        if self.session.generating {
            return Err(ChatError::InvalidState {
                operation: "regenerate".to_string(),
                reason: "a generation is already streaming".to_string(),
            });
        }

        let previous = if self.last_response.is_empty() {
            render_steps(&self.session.steps)
        } else {
            self.last_response.clone()
        };

        let mut messages: Vec<Message> = self.request.prompts.iter().map(Message::user).collect();
        messages.push(Message::assistant(previous));
        messages.push(Message::user(regeneration_message(instruction)));

        let mut request = self.request.clone();
        request.prompts.push(instruction.to_string());
        self.store.save_request(&request)?;
        self.request = request;

        if !self.edits.is_empty() {
            debug!("Dropping {} manual edits for regeneration", self.edits.len());
            self.edits.clear();
        }

        Ok(PreparedGeneration {
            kind: GenerationKind::Regeneration,
            request: ChatRequest::new(messages).model(self.request.model.clone()),
            base_steps: self.session.steps.clone(),
        })
    }

    /// Enter the streaming state for a prepared generation.
    pub fn begin(&mut self, prepared: &PreparedGeneration) {
        info!(
            "Starting {:?} generation with {} base steps",
            prepared.kind,
            prepared.base_steps.len()
        );
        self.base_steps = prepared.base_steps.clone();
        self.parser = ArtifactParser::new();
        self.last_response.clear();
        self.receiving = false;
        self.session.generating = true;
        self.session.steps = self.base_steps.clone();
        self.rebuild_tree();
        self.set_status(GenerationStatus::Connecting);
    }

    /// Open the response stream, switching to the fallback source if the
    /// primary fails or stays silent before sending any data.
    pub async fn open(&mut self, prepared: &PreparedGeneration) -> ChatResult<TextStream> {
        self.set_status(GenerationStatus::Sending);

        let result = match &self.fallback {
            None => self.source.open_stream(&prepared.request).await,
            Some(fallback) => {
                match open_with_first_chunk(self.source.as_ref(), &prepared.request, self.first_chunk_timeout).await
                {
                    Ok(stream) => Ok(stream),
                    Err(e) => {
                        warn!(
                            "{} failed before sending data ({}), falling back to {}",
                            self.source.name(),
                            e,
                            fallback.name()
                        );
                        self.emit(SessionEvent::FallbackEngaged {
                            source: fallback.name(),
                        });
                        // The primary's model name means nothing to another backend.
                        let request = prepared.request.clone().model(None);
                        fallback.open_stream(&request).await
                    }
                }
            }
        };

        if result.is_ok() {
            self.set_status(GenerationStatus::Thinking);
        }
        result
    }

    /// Feed one chunk. Returns `true` if the step sequence changed.
    pub fn apply_chunk(&mut self, chunk: &str) -> bool {
        if !self.receiving {
            self.receiving = true;
            self.set_status(GenerationStatus::Receiving);
        }
        self.last_response.push_str(chunk);

        let offset = last_step_id(&self.base_steps);
        let fresh: Vec<Step> = self
            .parser
            .push(chunk)
            .into_iter()
            .map(|step| step.offset_id(offset))
            .collect();

        let mut steps = self.base_steps.clone();
        steps.extend(fresh.iter().cloned());
        if steps == self.session.steps {
            return false;
        }

        self.session.steps = steps;
        self.rebuild_tree();
        self.emit(SessionEvent::StepsUpdated {
            count: self.session.steps.len(),
        });

        let newest_path = fresh
            .iter()
            .rev()
            .filter(|s| s.kind == StepKind::CreateFile)
            .find_map(|s| s.placeable_path())
            .and_then(normalize_path);
        if let Some(path) = newest_path {
            if self.session.active_path.as_deref() != Some(path.as_str())
                && find_file_by_path(&self.session.file_tree, &path).is_some()
            {
                self.session.active_path = Some(path.clone());
                self.emit(SessionEvent::ActiveFileChanged { path });
            }
        }
        true
    }

    /// The stream ended normally: persist and clear the in-flight marker.
    pub fn finish(&mut self) -> GenerationOutcome {
        self.session.generating = false;
        self.set_status(GenerationStatus::Completed);

        if let Err(e) = self.store.save_session(&self.request, &self.session.steps) {
            error!("Failed to save session: {}", e);
        }
        if let Err(e) = self.store.clear_request() {
            error!("Failed to clear pending request: {}", e);
        }

        let steps = self.session.steps.len();
        info!("Generation finished with {} steps", steps);
        self.emit(SessionEvent::Finished { steps });
        GenerationOutcome::Completed { steps }
    }

    /// The stream broke: keep partial steps, report the error.
    pub fn fail(&mut self, err: ChatError) -> GenerationOutcome {
        error!("Generation failed: {}", err);
        self.session.generating = false;
        self.set_status(GenerationStatus::Failed);

        let message = err.to_string();
        self.emit(SessionEvent::Failed {
            message: message.clone(),
        });
        GenerationOutcome::Failed { message }
    }

    /// Stream a prepared generation to the end.
    pub async fn run(&mut self, prepared: PreparedGeneration) -> GenerationOutcome {
        self.begin(&prepared);

        let mut stream = match self.open(&prepared).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(e),
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    self.apply_chunk(&chunk);
                }
                Err(e) => return self.fail(e),
            }
        }
        self.finish()
    }

    /// Overlay a user edit on an existing file. Returns `false` for unknown paths.
    pub fn edit_file(&mut self, path: &str, content: &str) -> bool {
        let Some(path) = normalize_path(path) else {
            return false;
        };
        match find_file_by_path_mut(&mut self.session.file_tree, &path) {
            Some(node) => {
                node.content = Some(content.to_string());
                self.edits.insert(path, content.to_string());
                true
            }
            None => false,
        }
    }

    /// Restore persisted state.
    ///
    /// A finished session wins over a pending request; a pending request is
    /// returned ready to be streamed again.
    pub fn resume(&mut self) -> ChatResult<ResumeAction> {
        if let Some(saved) = self.store.load_session()? {
            info!("Restoring session with {} steps", saved.steps.len());
            self.session = GenerationSession {
                prompt: saved.request.headline().to_string(),
                steps: saved.steps,
                ..GenerationSession::default()
            };
            self.request = saved.request;
            self.base_steps.clear();
            self.last_response.clear();
            self.edits.clear();
            self.rebuild_tree();
            self.session.active_path = find_first_file(&self.session.file_tree).map(|n| n.path.clone());
            if let Some(path) = self.session.active_path.clone() {
                self.emit(SessionEvent::ActiveFileChanged { path });
            }
            return Ok(ResumeAction::Restored {
                steps: self.session.steps.len(),
            });
        }

        match self.store.load_request()? {
            Some(request) => {
                info!("Restarting pending request: {}", request.headline());
                Ok(ResumeAction::Restart(self.prepare_initial(request)?))
            }
            None => Err(ChatError::NothingToResume),
        }
    }

    fn rebuild_tree(&mut self) {
        let mut tree = build_file_tree(&self.session.steps);
        for (path, content) in &self.edits {
            if let Some(node) = find_file_by_path_mut(&mut tree, path) {
                node.content = Some(content.clone());
            }
        }
        self.session.file_tree = tree;
    }

    fn set_status(&mut self, status: GenerationStatus) {
        self.session.status = Some(status);
        self.emit(SessionEvent::Status { status });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn open_with_first_chunk(
    source: &dyn TextSource,
    request: &ChatRequest,
    timeout: Duration,
) -> ChatResult<TextStream> {
    let attempt = async {
        let mut stream = source.open_stream(request).await?;
        match stream.next().await {
            Some(Ok(first)) => {
                let head = futures::stream::once(async move { Ok::<String, ChatError>(first) });
                Ok(Box::pin(head.chain(stream)) as TextStream)
            }
            Some(Err(e)) => Err(e),
            None => Ok(Box::pin(futures::stream::empty()) as TextStream),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::FirstChunkTimeout(timeout.as_secs())),
    }
}

/// Markup equivalent of a step sequence, used as assistant context when the
/// raw response is no longer available.
fn render_steps(steps: &[Step]) -> String {
    let title = steps
        .iter()
        .find(|s| s.kind == StepKind::ProjectInit)
        .map(|s| s.title.as_str())
        .unwrap_or(kiln_artifact::DEFAULT_ARTIFACT_TITLE);

    let mut out = format!("<artifact title=\"{}\">\n", title);
    for step in steps {
        match step.kind {
            StepKind::ProjectInit => {}
            StepKind::CreateFile => {
                let path = step.path.as_deref().unwrap_or_default();
                out.push_str(&format!(
                    "<action type=\"file\" path=\"{}\">\n{}\n</action>\n",
                    path, step.code
                ));
            }
            StepKind::RunCommand => {
                out.push_str(&format!("<action type=\"shell\">\n{}\n</action>\n", step.code));
            }
        }
    }
    out.push_str("</artifact>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockTextSource;
    use crate::mock::{ScriptedReply, ScriptedSource};
    use kiln_artifact::{parse_artifact, StepStatus};
    use tempfile::TempDir;

    const DEMO: &str = r#"<artifact title="Demo"><action type="file" path="a/b.txt">hello</action></artifact>"#;

    fn controller(
        source: ScriptedSource,
        temp: &TempDir,
    ) -> (SessionController, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = SessionStore::new(temp.path());
        (SessionController::new(Arc::new(source), store, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_run_initial_generation() {
        let temp = TempDir::new().unwrap();
        let source = ScriptedSource::new("primary").reply(ScriptedReply::text(DEMO, 9));
        let (mut controller, mut rx) = controller(source.clone(), &temp);

        let prepared = controller
            .prepare_initial(GenerationRequest::new("demo app"))
            .unwrap();
        assert!(controller.store.load_request().unwrap().is_some());

        let outcome = controller.run(prepared).await;
        assert_eq!(outcome, GenerationOutcome::Completed { steps: 2 });
        assert!(!controller.is_generating());
        assert_eq!(controller.steps(), parse_artifact(DEMO).as_slice());
        assert_eq!(controller.active_path(), Some("a/b.txt"));

        let events = drain(&mut rx);
        let statuses: Vec<GenerationStatus> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Status { status } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                GenerationStatus::Connecting,
                GenerationStatus::Sending,
                GenerationStatus::Thinking,
                GenerationStatus::Receiving,
                GenerationStatus::Completed
            ]
        );
        assert!(events.contains(&SessionEvent::ActiveFileChanged {
            path: "a/b.txt".to_string()
        }));

        // persisted, marker removed
        let saved = controller.store.load_session().unwrap().unwrap();
        assert_eq!(saved.steps.len(), 2);
        assert_eq!(saved.request.prompts, vec!["demo app".to_string()]);
        assert!(controller.store.load_request().unwrap().is_none());

        let request = &source.requests()[0];
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.last_content(), Some("demo app"));
    }

    #[tokio::test]
    async fn test_stream_error_keeps_partial_steps() {
        let temp = TempDir::new().unwrap();
        let source = ScriptedSource::new("primary").reply(ScriptedReply::ChunksThenError(
            vec!["<artifact><action type=\"file\" path=\"x.ts\">const".to_string()],
            "connection reset".to_string(),
        ));
        let (mut controller, mut rx) = controller(source, &temp);

        let prepared = controller.prepare_initial(GenerationRequest::new("x")).unwrap();
        let outcome = controller.run(prepared).await;

        assert!(!outcome.is_completed());
        assert!(!controller.is_generating());
        assert_eq!(controller.session().status, Some(GenerationStatus::Failed));
        assert_eq!(controller.steps().len(), 2);
        assert!(controller.steps()[1].is_pending());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::Failed { message } if message.contains("connection reset"))));
        // request marker kept for resume
        assert!(controller.store.load_request().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_regeneration_request_and_id_offset() {
        let temp = TempDir::new().unwrap();
        let second = r#"<artifact title="Fix"><action type="file" path="a/b.txt">fixed</action></artifact>"#;
        let source = ScriptedSource::new("primary")
            .reply(ScriptedReply::text(DEMO, 20))
            .reply(ScriptedReply::text(second, 20));
        let (mut controller, _rx) = controller(source.clone(), &temp);

        let prepared = controller.prepare_initial(GenerationRequest::new("demo")).unwrap();
        controller.run(prepared).await;

        let instruction = "I encountered this error during execution: SyntaxError. Please fix it.";
        let regen = controller.prepare_regeneration(instruction).unwrap();
        assert_eq!(regen.kind, GenerationKind::Regeneration);
        assert_eq!(regen.base_steps.len(), 2);

        let roles: Vec<_> = regen.request.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![crate::MessageRole::User, crate::MessageRole::Assistant, crate::MessageRole::User]
        );
        assert_eq!(regen.request.messages[1].content, DEMO);
        assert!(regen.request.messages[2].content.contains(instruction));
        assert_eq!(
            controller.store.load_request().unwrap().unwrap().prompts,
            vec!["demo".to_string(), instruction.to_string()]
        );

        controller.run(regen).await;
        let ids: Vec<u32> = controller.steps().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        let tree = controller.file_tree();
        assert_eq!(find_file_by_path(tree, "a/b.txt").unwrap().content_str(), "fixed");
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_on_open_error() {
        let temp = TempDir::new().unwrap();
        let primary = ScriptedSource::new("primary").reply(ScriptedReply::OpenError("503".to_string()));
        let fallback = ScriptedSource::new("relay").reply(ScriptedReply::text(DEMO, 30));
        let (controller, mut rx) = controller(primary, &temp);
        let mut controller = controller.with_fallback(Arc::new(fallback.clone()));

        let prepared = controller.prepare_initial(GenerationRequest::new("demo")).unwrap();
        assert!(controller.run(prepared).await.is_completed());
        assert_eq!(fallback.request_count(), 1);
        assert!(drain(&mut rx).contains(&SessionEvent::FallbackEngaged {
            source: "relay".to_string()
        }));
    }

    #[tokio::test]
    async fn test_fallback_uses_its_own_model() {
        let temp = TempDir::new().unwrap();
        let primary = ScriptedSource::new("openai").reply(ScriptedReply::OpenError("401".to_string()));
        let fallback = ScriptedSource::new("anthropic").reply(ScriptedReply::text(DEMO, 30));
        let (controller, _rx) = controller(primary.clone(), &temp);
        let mut controller = controller.with_fallback(Arc::new(fallback.clone()));

        let request = GenerationRequest::new("demo").with_model("gpt-5-mini");
        let prepared = controller.prepare_initial(request).unwrap();
        assert!(controller.run(prepared).await.is_completed());

        assert_eq!(primary.requests()[0].model.as_deref(), Some("gpt-5-mini"));
        assert_eq!(fallback.requests()[0].model, None);
        assert_eq!(fallback.requests()[0].messages.len(), primary.requests()[0].messages.len());
    }

    #[tokio::test]
    async fn test_fallback_on_first_chunk_timeout() {
        let temp = TempDir::new().unwrap();
        let primary = ScriptedSource::new("primary").reply(ScriptedReply::Stall);
        let fallback = ScriptedSource::new("relay").reply(ScriptedReply::text(DEMO, 30));
        let (controller, _rx) = controller(primary, &temp);
        let mut controller = controller
            .with_fallback(Arc::new(fallback.clone()))
            .with_first_chunk_timeout(Duration::from_millis(50));

        let prepared = controller.prepare_initial(GenerationRequest::new("demo")).unwrap();
        assert!(controller.run(prepared).await.is_completed());
        assert_eq!(controller.steps().len(), 2);
    }

    #[tokio::test]
    async fn test_first_chunk_kept_when_primary_answers() {
        let temp = TempDir::new().unwrap();
        let primary = ScriptedSource::new("primary").reply(ScriptedReply::text(DEMO, 5));
        let fallback = ScriptedSource::new("relay");
        let (controller, _rx) = controller(primary, &temp);
        let mut controller = controller.with_fallback(Arc::new(fallback.clone()));

        let prepared = controller.prepare_initial(GenerationRequest::new("demo")).unwrap();
        controller.run(prepared).await;
        assert_eq!(controller.last_response(), DEMO);
        assert_eq!(fallback.request_count(), 0);
    }

    #[tokio::test]
    async fn test_open_error_without_fallback_fails() {
        let temp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut source = MockTextSource::new();
        source.expect_name().return_const("mock".to_string());
        source
            .expect_open_stream()
            .times(1)
            .returning(|_| Err(ChatError::LlmError("401 Unauthorized".to_string())));
        let mut controller = SessionController::new(Arc::new(source), SessionStore::new(temp.path()), tx);

        let prepared = controller.prepare_initial(GenerationRequest::new("demo")).unwrap();
        let outcome = controller.run(prepared).await;
        assert!(matches!(outcome, GenerationOutcome::Failed { message } if message.contains("401")));
    }

    #[tokio::test]
    async fn test_active_file_follows_newest_step() {
        let temp = TempDir::new().unwrap();
        let (mut controller, mut rx) = controller(ScriptedSource::new("unused"), &temp);
        let prepared = controller.prepare_initial(GenerationRequest::new("x")).unwrap();
        controller.begin(&prepared);

        controller.apply_chunk("<artifact><action type=\"file\" path=\"a.ts\">a</action>");
        assert_eq!(controller.active_path(), Some("a.ts"));
        // opening tag without content: not in the tree yet
        controller.apply_chunk("<action type=\"file\" path=\"b.ts\">");
        assert_eq!(controller.active_path(), Some("a.ts"));
        controller.apply_chunk("b");
        assert_eq!(controller.active_path(), Some("b.ts"));

        let switches = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ActiveFileChanged { .. }))
            .count();
        assert_eq!(switches, 2);
    }

    #[tokio::test]
    async fn test_edits_overlay_until_regeneration() {
        let temp = TempDir::new().unwrap();
        let source = ScriptedSource::new("primary").reply(ScriptedReply::text(DEMO, 50));
        let (mut controller, _rx) = controller(source, &temp);
        let prepared = controller.prepare_initial(GenerationRequest::new("x")).unwrap();
        controller.run(prepared).await;

        assert!(controller.edit_file("/a/b.txt", "edited"));
        assert!(!controller.edit_file("a/missing.txt", "nope"));
        assert_eq!(
            find_file_by_path(controller.file_tree(), "a/b.txt").unwrap().content_str(),
            "edited"
        );

        let regen = controller.prepare_regeneration("change colours").unwrap();
        controller.begin(&regen);
        assert_eq!(
            find_file_by_path(controller.file_tree(), "a/b.txt").unwrap().content_str(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_regeneration_rejected_while_streaming() {
        let temp = TempDir::new().unwrap();
        let (mut controller, _rx) = controller(ScriptedSource::new("unused"), &temp);
        let prepared = controller.prepare_initial(GenerationRequest::new("x")).unwrap();
        controller.begin(&prepared);
        assert!(matches!(
            controller.prepare_regeneration("again"),
            Err(ChatError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_prefers_saved_session() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path());
        let steps = parse_artifact(DEMO);
        store.save_session(&GenerationRequest::new("demo"), &steps).unwrap();
        store.save_request(&GenerationRequest::new("other")).unwrap();

        let (mut controller, _rx) = controller(ScriptedSource::new("unused"), &temp);
        match controller.resume().unwrap() {
            ResumeAction::Restored { steps } => assert_eq!(steps, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!controller.is_generating());
        assert_eq!(controller.active_path(), Some("a/b.txt"));
        assert_eq!(controller.session().prompt, "demo");

        // no raw text after resume: markup is rebuilt from the steps
        let regen = controller.prepare_regeneration("fix").unwrap();
        let rebuilt = parse_artifact(&regen.request.messages[1].content);
        assert_eq!(rebuilt, steps);
    }

    #[tokio::test]
    async fn test_resume_restarts_pending_request() {
        let temp = TempDir::new().unwrap();
        SessionStore::new(temp.path())
            .save_request(&GenerationRequest::new("todo").with_model("anthropic"))
            .unwrap();

        let (mut controller, _rx) = controller(ScriptedSource::new("unused"), &temp);
        match controller.resume().unwrap() {
            ResumeAction::Restart(prepared) => {
                assert_eq!(prepared.kind, GenerationKind::Initial);
                assert_eq!(prepared.request.model.as_deref(), Some("anthropic"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_with_nothing_saved() {
        let temp = TempDir::new().unwrap();
        let (mut controller, _rx) = controller(ScriptedSource::new("unused"), &temp);
        assert!(matches!(controller.resume(), Err(ChatError::NothingToResume)));
    }

    #[test]
    fn test_render_steps_round_trips_through_parser() {
        let steps = vec![
            Step::project_init(1, "Shop"),
            Step::create_file(2, "src/App.tsx", "export default 1;", StepStatus::Completed),
            Step::run_command(3, "npm install", StepStatus::Completed),
        ];
        assert_eq!(parse_artifact(&render_steps(&steps)), steps);
    }
}
