//! Streaming text sources.
//!
//! [`LlmAdapter`] talks to OpenAI, Anthropic or a plain-text relay backend,
//! selected from environment variables or workspace settings. Everything
//! downstream only sees the [`TextSource`] trait.

use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::prompts::ARTIFACT_SYSTEM_PROMPT;
use crate::sse::{SseDecoder, SseEvent, Utf8Decoder};
use crate::types::{ChatRequest, Message, MessageRole};

/// A stream of response text fragments.
pub type TextStream = Pin<Box<dyn Stream<Item = ChatResult<String>> + Send>>;

/// Opaque source of streamed model output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> String;

    /// Send the request and return the response as a text stream.
    async fn open_stream(&self, request: &ChatRequest) -> ChatResult<TextStream>;
}

/// LLM provider type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
    /// Backend exposing `POST /chat` with a plain-text streamed body
    Relay,
}

impl LlmProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" => Some(Self::Anthropic),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-5-mini",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Relay => "gemini",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Relay => "http://localhost:3000",
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAI => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// LLM adapter that handles streaming API calls
pub struct LlmAdapter {
    provider: LlmProvider,
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for LlmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAdapter")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

const MAX_RETRIES: u32 = 3;
const ANTHROPIC_MAX_TOKENS: u32 = 8192;

impl LlmAdapter {
    /// Create a new LLM adapter with explicit configuration
    pub fn new(provider: LlmProvider, api_key: String, model: Option<String>) -> Self {
        Self {
            model: model.unwrap_or_else(|| provider.default_model().to_string()),
            base_url: provider.default_base_url().to_string(),
            provider,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Adapter for a relay backend at `base_url`.
    pub fn relay(base_url: impl Into<String>, model: Option<String>) -> Self {
        Self::new(LlmProvider::Relay, String::new(), model).with_base_url(base_url)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Create an LLM adapter from environment variables
    ///
    /// Checks in order:
    /// 1. OPENAI_API_KEY
    /// 2. ANTHROPIC_API_KEY
    /// 3. KILN_RELAY_URL
    pub fn from_env() -> ChatResult<Self> {
        let custom_model = non_empty_env("KILN_LLM_MODEL");

        for provider in [LlmProvider::OpenAI, LlmProvider::Anthropic, LlmProvider::Relay] {
            if let Ok(adapter) = Self::for_provider(&provider, custom_model.clone()) {
                return Ok(adapter);
            }
        }

        Err(ChatError::LlmNotConfigured)
    }

    /// Create an adapter for one provider, reading its credentials from the environment.
    pub fn for_provider(provider: &LlmProvider, model: Option<String>) -> ChatResult<Self> {
        match provider {
            LlmProvider::OpenAI => non_empty_env("OPENAI_API_KEY")
                .map(|key| Self::new(LlmProvider::OpenAI, key, model))
                .ok_or(ChatError::LlmNotConfigured),
            LlmProvider::Anthropic => non_empty_env("ANTHROPIC_API_KEY")
                .map(|key| Self::new(LlmProvider::Anthropic, key, model))
                .ok_or(ChatError::LlmNotConfigured),
            LlmProvider::Relay => non_empty_env("KILN_RELAY_URL")
                .map(|url| Self::relay(url, model))
                .ok_or(ChatError::LlmNotConfigured),
        }
    }

    /// Create an LLM adapter from workspace settings
    ///
    /// Reads `defaultProvider` and `defaultModel` from `.kiln/settings.json`;
    /// credentials still come from the environment.
    pub fn from_settings(workspace_root: &Path) -> ChatResult<Self> {
        let settings_path = workspace_root.join(".kiln").join("settings.json");

        let settings = std::fs::read_to_string(&settings_path)
            .ok()
            .and_then(|content| serde_json::from_str::<Value>(&content).ok());

        let provider = settings
            .as_ref()
            .and_then(|s| s.get("defaultProvider"))
            .and_then(|v| v.as_str())
            .and_then(LlmProvider::parse)
            .unwrap_or(LlmProvider::OpenAI);
        let model = settings
            .as_ref()
            .and_then(|s| s.get("defaultModel"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Self::for_provider(&provider, model)
    }

    /// Get the current provider
    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    /// Get the current model
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        match self.provider {
            LlmProvider::OpenAI => {
                let mut messages: Vec<WireMessage> = Vec::new();
                if !request.messages.iter().any(|m| m.role == MessageRole::System) {
                    messages.push(WireMessage::new(MessageRole::System, ARTIFACT_SYSTEM_PROMPT));
                }
                messages.extend(request.messages.iter().map(WireMessage::from));

                self.client
                    .post(format!("{}/chat/completions", self.base_url))
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&OpenAIRequest {
                        model,
                        messages,
                        stream: true,
                    })
            }
            LlmProvider::Anthropic => {
                let system = request
                    .messages
                    .iter()
                    .find(|m| m.role == MessageRole::System)
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| ARTIFACT_SYSTEM_PROMPT.to_string());
                let messages = request
                    .messages
                    .iter()
                    .filter(|m| m.role != MessageRole::System)
                    .map(WireMessage::from)
                    .collect();

                self.client
                    .post(format!("{}/messages", self.base_url))
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&AnthropicRequest {
                        model,
                        max_tokens: ANTHROPIC_MAX_TOKENS,
                        system,
                        messages,
                        stream: true,
                    })
            }
            LlmProvider::Relay => self
                .client
                .post(format!("{}/chat", self.base_url))
                .json(&RelayRequest {
                    messages: request.messages.iter().map(WireMessage::from).collect(),
                    model,
                }),
        }
    }
}

#[async_trait]
impl TextSource for LlmAdapter {
    fn name(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }

    async fn open_stream(&self, request: &ChatRequest) -> ChatResult<TextStream> {
        // Retry transient errors (5xx, rate limits, network issues) until the body starts
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << attempt);
                debug!("Retrying {} in {:?}", self.name(), delay);
                tokio::time::sleep(delay).await;
            }

            let response = match self.build_request(request).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(ChatError::LlmError(format!("Network error: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "{} API error {} (attempt {}/{})",
                    self.provider,
                    status,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_error = Some(ChatError::LlmError(format!(
                    "{} API error {}: {}",
                    self.provider, status, body
                )));
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::LlmError(format!(
                    "{} API error {}: {}",
                    self.provider, status, body
                )));
            }

            let bytes = response.bytes_stream();
            return Ok(match self.provider {
                LlmProvider::OpenAI => sse_text_stream(bytes, openai_delta),
                LlmProvider::Anthropic => sse_text_stream(bytes, anthropic_delta),
                LlmProvider::Relay => plain_text_stream(bytes),
            });
        }

        Err(last_error.unwrap_or_else(|| ChatError::LlmError("Max retries exceeded".to_string())))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Turn an SSE byte stream into text fragments using `extract` per event.
///
/// A final event that is not followed by a blank line is still delivered
/// when the byte stream ends.
pub fn sse_text_stream<S, B>(bytes: S, extract: fn(&SseEvent) -> Option<ChatResult<String>>) -> TextStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(bytes), SseDecoder::new(), false);
    let stream = futures::stream::unfold(state, move |(mut bytes, mut decoder, done)| async move {
        if done {
            return None;
        }
        let items = match bytes.next().await {
            Some(Ok(chunk)) => decoder
                .feed(chunk.as_ref())
                .iter()
                .filter_map(extract)
                .collect::<Vec<_>>(),
            Some(Err(e)) => vec![Err(ChatError::StreamError(e.to_string()))],
            None => {
                let last = decoder.finish().as_ref().and_then(extract);
                return Some((last.into_iter().collect(), (bytes, decoder, true)));
            }
        };
        Some((items, (bytes, decoder, false)))
    })
    .flat_map(futures::stream::iter);
    Box::pin(stream)
}

/// Turn a plain-text byte stream into text fragments.
pub fn plain_text_stream<S, B>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(bytes), Utf8Decoder::new(), false);
    let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, done)| async move {
        if done {
            return None;
        }
        let (item, done) = match bytes.next().await {
            Some(Ok(chunk)) => (Some(Ok(decoder.feed(chunk.as_ref()))), false),
            Some(Err(e)) => (Some(Err(ChatError::StreamError(e.to_string()))), false),
            None => (Some(Ok(decoder.finish())), true),
        };
        Some((item, (bytes, decoder, done)))
    })
    .filter_map(|item| futures::future::ready(item.filter(|i| !matches!(i, Ok(t) if t.is_empty()))));
    Box::pin(stream)
}

/// `choices[0].delta.content` of an OpenAI chunk.
pub fn openai_delta(event: &SseEvent) -> Option<ChatResult<String>> {
    if event.is_done() {
        return None;
    }
    let json: Value = serde_json::from_str(&event.data).ok()?;
    if let Some(message) = json.get("error").map(error_message) {
        return Some(Err(ChatError::StreamError(message)));
    }
    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| Ok(s.to_string()))
}

/// Text of an Anthropic `content_block_delta` event.
pub fn anthropic_delta(event: &SseEvent) -> Option<ChatResult<String>> {
    let json: Value = serde_json::from_str(&event.data).ok()?;
    let kind = event
        .event_type
        .as_deref()
        .or_else(|| json["type"].as_str())?;

    match kind {
        "content_block_delta" if json["delta"]["type"] == "text_delta" => json["delta"]["text"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| Ok(s.to_string())),
        "error" => Some(Err(ChatError::StreamError(error_message(&json["error"])))),
        _ => None,
    }
}

fn error_message(error: &Value) -> String {
    error["message"]
        .as_str()
        .map(|s| s.to_string())
        .unwrap_or_else(|| error.to_string())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct WireMessage {
    role: String,
    content: String,
}

impl WireMessage {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role: role.as_str().to_string(),
            content: content.into(),
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct RelayRequest {
    messages: Vec<WireMessage>,
    model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>, reqwest::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures::stream::iter(owned)
    }

    async fn collect(stream: TextStream) -> Vec<String> {
        stream.map(|item| item.unwrap()).collect().await
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(LlmProvider::parse("Anthropic"), Some(LlmProvider::Anthropic));
        assert_eq!(LlmProvider::parse("relay"), Some(LlmProvider::Relay));
        assert_eq!(LlmProvider::parse("gemini"), None);
    }

    #[test]
    fn test_default_models() {
        let openai = LlmAdapter::new(LlmProvider::OpenAI, "key".to_string(), None);
        assert_eq!(openai.model(), "gpt-5-mini");

        let relay = LlmAdapter::relay("http://localhost:3000/", None);
        assert_eq!(relay.model(), "gemini");
        assert_eq!(relay.base_url, "http://localhost:3000");
        assert_eq!(relay.name(), "relay:gemini");
    }

    #[test]
    fn test_custom_model() {
        let adapter = LlmAdapter::new(
            LlmProvider::Anthropic,
            "key".to_string(),
            Some("claude-opus".to_string()),
        );
        assert_eq!(adapter.model(), "claude-opus");
    }

    #[tokio::test]
    async fn test_openai_stream_decoding() {
        let body = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"<arti\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"fact>\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let text = collect(sse_text_stream(body, openai_delta)).await;
        assert_eq!(text, vec!["<arti".to_string(), "fact>".to_string()]);
    }

    #[tokio::test]
    async fn test_anthropic_stream_decoding() {
        let body = chunks(&[
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]);
        let text = collect(sse_text_stream(body, anthropic_delta)).await;
        assert_eq!(text, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_anthropic_error_event() {
        let body = chunks(&["event: error\ndata: {\"type\":\"error\",\"error\":{\"message\":\"Overloaded\"}}\n\n"]);
        let items: Vec<ChatResult<String>> = sse_text_stream(body, anthropic_delta).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(ChatError::StreamError(m)) if m == "Overloaded"));
    }

    #[tokio::test]
    async fn test_relay_stream_keeps_utf8_intact() {
        let bytes = "✓ done".as_bytes();
        let owned: Vec<Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(bytes[..1].to_vec()), Ok(bytes[1..].to_vec())];
        let text = collect(plain_text_stream(futures::stream::iter(owned))).await;
        assert_eq!(text.concat(), "✓ done");
    }

    #[tokio::test]
    async fn test_sse_final_event_without_blank_line() {
        let body = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"<artifact>\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"</artifact>\"}}]}",
        ]);
        let text = collect(sse_text_stream(body, openai_delta)).await;
        assert_eq!(text.concat(), "<artifact></artifact>");
    }

    #[tokio::test]
    async fn test_relay_stream_flushes_truncated_tail() {
        let bytes = "ok ✓".as_bytes();
        let cut = bytes.len() - 1;
        let owned: Vec<Result<Vec<u8>, reqwest::Error>> = vec![Ok(bytes[..cut].to_vec())];
        let text = collect(plain_text_stream(futures::stream::iter(owned))).await;
        assert_eq!(text.concat(), "ok \u{FFFD}");
    }

    #[test]
    fn test_wire_message_from_message() {
        let wire = WireMessage::from(&Message::user("build a todo app"));
        assert_eq!(wire, WireMessage::new(MessageRole::User, "build a todo app"));
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("id").is_none());
    }
}
