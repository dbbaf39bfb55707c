use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use soma_llm::provider::{ChatMessage, CompletionRequest, LlmError, LlmProvider, ToolDefinition};

use crate::schema::preview;

const ROUTER_MAX_TOKENS: u32 = 512;
const ROUTER_TEMPERATURE: f32 = 0.0;

/// A function the model chose, with its raw arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// Asks a model to pick one of `functions`. `Ok(None)` means the model
/// answered without choosing any.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        context: &[ChatMessage],
        functions: &[ToolDefinition],
    ) -> Result<Option<FunctionCall>, LlmError>;
}

/// [`CompletionClient`] over an [`LlmProvider`] with native function calling.
/// Providers that answer in plain text are still understood when the text
/// is a JSON object naming a function.
pub struct LlmCompletion {
    provider: Arc<dyn LlmProvider>,
}

impl LlmCompletion {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl CompletionClient for LlmCompletion {
    async fn generate(
        &self,
        system_prompt: &str,
        context: &[ChatMessage],
        functions: &[ToolDefinition],
    ) -> Result<Option<FunctionCall>, LlmError> {
        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(context);

        let request = CompletionRequest {
            messages,
            max_tokens: ROUTER_MAX_TOKENS,
            temperature: ROUTER_TEMPERATURE,
            tools: functions.to_vec(),
        };
        let response = self.provider.complete(request).await?;

        if let Some((name, input)) = response.first_tool_use() {
            return Ok(Some(FunctionCall { name: name.to_string(), arguments: input.clone() }));
        }

        match parse_function_json(&response.content) {
            Ok(call) => Ok(Some(call)),
            Err(reason) => {
                tracing::debug!(
                    provider = self.provider.name(),
                    reason = %reason,
                    content_preview = %preview(&response.content, 160),
                    "completion chose no function"
                );
                Ok(None)
            }
        }
    }
}

/// Accepts `{"function": name, "arguments": {...}}` (or `name`/`input`
/// spellings), optionally wrapped in a markdown fence or prose.
fn parse_function_json(raw: &str) -> Result<FunctionCall, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("completion output is empty".into());
    }

    let candidate = if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        let end = lines
            .iter()
            .skip(1)
            .rposition(|l| l.trim_start().starts_with("```"))
            .map(|i| i + 1)
            .unwrap_or(lines.len());
        lines[1.min(end)..end].join("\n")
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        trimmed[start..=end].to_string()
    } else {
        trimmed.to_string()
    };

    let value: Value = serde_json::from_str(&candidate).map_err(|e| format!("invalid function JSON: {e}"))?;
    let name = ["function", "name", "tool"]
        .iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .ok_or_else(|| "function JSON names no function".to_string())?;
    let arguments = ["arguments", "input", "args"]
        .iter()
        .find_map(|k| value.get(*k).cloned())
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok(FunctionCall { name: name.to_string(), arguments })
}
