//! HTTP completion provider for OpenAI-compatible chat endpoints
//! (OpenAI, Azure-style proxies, DeepSeek, Gemini's OpenAI surface) with
//! native function calling.

use crate::provider::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmError, LlmProvider, Role, StopReason,
    ToolDefinition,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ── Request types ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

impl<'a> From<&'a ToolDefinition> for WireTool<'a> {
    fn from(td: &'a ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: WireFunction {
                name: &td.name,
                description: &td.description,
                parameters: &td.input_schema,
            },
        }
    }
}

// ── Response types ──

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    id: String,
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    name: String,
    /// JSON-encoded argument object.
    arguments: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── Provider ──

/// OpenAI-compatible chat completion provider.
pub struct HttpProvider {
    model: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    /// Build from model name + API key + optional base URL override.
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        Self {
            model,
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn complete_chat(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage { role: role_str(m.role), content: &m.content })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: request.tools.iter().map(WireTool::from).collect(),
            tool_choice: (!request.tools.is_empty()).then_some("auto"),
        };

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(check_error(status, text));
        }

        let api: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        Ok(into_completion(api))
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Parse error response, returning RateLimited for 429.
fn check_error(status: reqwest::StatusCode, body: String) -> LlmError {
    if status.as_u16() == 429 {
        LlmError::RateLimited
    } else {
        LlmError::RequestFailed(format!("{status}: {body}"))
    }
}

fn into_completion(api: ChatResponse) -> CompletionResponse {
    let (input_tokens, output_tokens) = api
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));
    let Some(choice) = api.choices.into_iter().next() else {
        return CompletionResponse { input_tokens, output_tokens, ..Default::default() };
    };

    let mut blocks = Vec::new();
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls {
        // Malformed argument JSON is passed through as a string so the caller
        // can reject it and retry.
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::String(call.function.arguments));
        blocks.push(ContentBlock::ToolUse { id: call.id, name: call.function.name, input });
    }

    let mut resp = CompletionResponse::from_blocks(blocks);
    if choice.finish_reason.as_deref() == Some("length") {
        resp.stop_reason = StopReason::MaxTokens;
    }
    resp.input_tokens = input_tokens;
    resp.output_tokens = output_tokens;
    resp
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        Box::pin(self.complete_chat(request))
    }
}

/// Build a provider from `SOMA_LLM_MODEL`, `SOMA_LLM_API_KEY` and optionally
/// `SOMA_LLM_BASE_URL`. Returns `None` if model or key is not set.
pub fn from_env() -> Option<HttpProvider> {
    let model = std::env::var("SOMA_LLM_MODEL").ok()?;
    let api_key = std::env::var("SOMA_LLM_API_KEY").ok()?;
    let base_url = std::env::var("SOMA_LLM_BASE_URL").ok();
    Some(HttpProvider::new(model, api_key, base_url))
}
