//! Chat model capability.
//!
//! The research pipeline never talks to a concrete provider directly; it
//! consumes this trait. Implementations must honour the cancellation token
//! passed with every invocation.

use crate::error::LlmError;
use crate::types::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Trait for chat-completion capable language models.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send a conversation and return the assistant's text reply.
    async fn invoke(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

type Handler = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

/// Scriptable chat model for tests and offline runs.
///
/// Replies are taken from a queue first, then from an optional handler,
/// then fall back to a fixed default reply.
pub struct MockChatModel {
    model: String,
    queue: Mutex<VecDeque<Result<String, String>>>,
    handler: Option<Handler>,
    default_reply: String,
    calls: AtomicUsize,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            queue: Mutex::new(VecDeque::new()),
            handler: None,
            default_reply: String::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// A model that always answers with `text`.
    pub fn with_response(text: &str) -> Self {
        Self {
            default_reply: text.to_string(),
            ..Self::new()
        }
    }

    /// A model whose replies are computed from the incoming conversation.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    /// Queue a reply for the next invocation.
    pub fn queue_response(&self, text: impl Into<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Ok(text.into()));
        }
    }

    /// Queue a failure for the next invocation.
    pub fn queue_failure(&self, message: impl Into<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Err(message.into()));
        }
    }

    /// Number of invocations served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockChatModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn invoke(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(reply) = queued {
            return reply.map_err(|message| LlmError::ApiRequest { message });
        }
        if let Some(handler) = &self.handler {
            return handler(messages);
        }
        Ok(self.default_reply.clone())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Strip a fenced code block wrapper (```json ... ```) from a model reply.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().trim_end_matches("```").trim()
}

/// Slice out the outermost `open ... close` span of a model reply, if any.
pub fn json_span(reply: &str, open: char, close: char) -> Option<&str> {
    let body = strip_code_fence(reply);
    let start = body.find(open)?;
    let end = body.rfind(close)?;
    (end > start).then(|| &body[start..=end])
}
