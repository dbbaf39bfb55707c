use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ── Function calling types ──

/// A callable function offered to the model (name + description + JSON Schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A content block in a model response — plain text or a function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Functions the model may call (empty = plain completion).
    pub tools: Vec<ToolDefinition>,
}

/// LLM completion response.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Concatenation of all Text blocks.
    pub content: String,
    pub content_blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl CompletionResponse {
    /// Build a response from blocks, deriving the text field and stop reason.
    pub fn from_blocks(blocks: Vec<ContentBlock>) -> Self {
        let content = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let stop_reason = if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })) {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        Self { content, content_blocks: blocks, stop_reason, input_tokens: 0, output_tokens: 0 }
    }

    /// First function call in the response, if any.
    pub fn first_tool_use(&self) -> Option<(&str, &serde_json::Value)> {
        self.content_blocks.iter().find_map(|b| match b {
            ContentBlock::ToolUse { name, input, .. } => Some((name.as_str(), input)),
            _ => None,
        })
    }
}

/// Error type for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// Trait for completion providers (OpenAI-compatible endpoints, test doubles).
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

/// Test provider that replays queued responses in order.
/// Once the queue is drained every call returns an empty text response.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<CompletionResponse, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a function call response.
    pub fn push_call(&self, name: impl Into<String>, input: serde_json::Value) -> &Self {
        let block = ContentBlock::ToolUse {
            id: format!("call_{}", self.queued()),
            name: name.into(),
            input,
        };
        self.push(Ok(CompletionResponse::from_blocks(vec![block])))
    }

    /// Queue a plain text response.
    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        let block = ContentBlock::Text { text: text.into() };
        self.push(Ok(CompletionResponse::from_blocks(vec![block])))
    }

    /// Queue a transport failure.
    pub fn push_error(&self, reason: impl Into<String>) -> &Self {
        self.push(Err(reason.into()))
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn queued(&self) -> usize {
        self.responses.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn push(&self, response: Result<CompletionResponse, String>) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
        self
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(reason)) => Err(LlmError::RequestFailed(reason)),
                None => Ok(CompletionResponse::from_blocks(vec![ContentBlock::Text {
                    text: String::new(),
                }])),
            }
        })
    }
}
