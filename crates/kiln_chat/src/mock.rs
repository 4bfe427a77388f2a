//! Scripted text source for testing.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ChatError, ChatResult};
use crate::llm::{TextSource, TextStream};
use crate::types::ChatRequest;

/// What one call to `open_stream` does.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these fragments, then end
    Chunks(Vec<String>),
    /// Stream these fragments, then fail
    ChunksThenError(Vec<String>, String),
    /// Fail before streaming
    OpenError(String),
    /// Open successfully but never send anything
    Stall,
}

impl ScriptedReply {
    /// Stream `text` in fragments of `size` characters.
    pub fn text(text: &str, size: usize) -> Self {
        Self::Chunks(split_text(text, size))
    }
}

/// Split `text` into fragments of at most `size` characters.
pub fn split_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Text source that replays scripted replies and captures requests.
///
/// Replies are consumed in order; the last one repeats.
#[derive(Clone)]
pub struct ScriptedSource {
    name: String,
    replies: Arc<RwLock<VecDeque<ScriptedReply>>>,
    requests: Arc<RwLock<Vec<ChatRequest>>>,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Arc::new(RwLock::new(VecDeque::new())),
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn reply(self, reply: ScriptedReply) -> Self {
        self.replies.write().push_back(reply);
        self
    }

    /// Captured requests, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.read().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }

    fn next_reply(&self) -> ScriptedReply {
        let mut replies = self.replies.write();
        if replies.len() > 1 {
            replies.pop_front().unwrap_or(ScriptedReply::Chunks(Vec::new()))
        } else {
            replies
                .front()
                .cloned()
                .unwrap_or(ScriptedReply::Chunks(Vec::new()))
        }
    }
}

#[async_trait]
impl TextSource for ScriptedSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn open_stream(&self, request: &ChatRequest) -> ChatResult<TextStream> {
        self.requests.write().push(request.clone());

        match self.next_reply() {
            ScriptedReply::Chunks(chunks) => {
                Ok(Box::pin(futures::stream::iter(
                    chunks.into_iter().map(Ok::<String, ChatError>),
                )))
            }
            ScriptedReply::ChunksThenError(chunks, message) => {
                let items = chunks
                    .into_iter()
                    .map(Ok::<String, ChatError>)
                    .chain(std::iter::once(Err(ChatError::StreamError(message))));
                Ok(Box::pin(futures::stream::iter(items)))
            }
            ScriptedReply::OpenError(message) => Err(ChatError::LlmError(message)),
            ScriptedReply::Stall => Ok(Box::pin(futures::stream::pending::<ChatResult<String>>())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures::StreamExt;

    #[test]
    fn test_split_text_on_char_boundaries() {
        assert_eq!(split_text("a✓bc", 2), vec!["a✓".to_string(), "bc".to_string()]);
        assert!(split_text("", 3).is_empty());
    }

    #[tokio::test]
    async fn test_replies_in_order_last_repeats() {
        let source = ScriptedSource::new("scripted")
            .reply(ScriptedReply::OpenError("down".to_string()))
            .reply(ScriptedReply::text("hello", 2));
        let request = ChatRequest::new(vec![Message::user("hi")]);

        assert!(source.open_stream(&request).await.is_err());
        for _ in 0..2 {
            let stream = source.open_stream(&request).await.unwrap();
            let text: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
            assert_eq!(text.concat(), "hello");
        }
        assert_eq!(source.request_count(), 3);
    }

    #[tokio::test]
    async fn test_chunks_then_error() {
        let source = ScriptedSource::new("scripted").reply(ScriptedReply::ChunksThenError(
            vec!["partial".to_string()],
            "connection reset".to_string(),
        ));
        let stream = source.open_stream(&ChatRequest::new(Vec::new())).await.unwrap();
        let items: Vec<ChatResult<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
