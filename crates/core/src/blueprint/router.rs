//! The two ways a router picks a destination: a deterministic script, and an
//! LLM choosing among the router's children exposed as functions.

use serde_json::{Map, Value};

use soma_llm::provider::{ChatMessage, ToolDefinition};

use super::{Blueprint, BlueprintRuntime, RouterNode};
use crate::error::RoutingError;
use crate::schema::{preview, validate_arguments};
use crate::types::Event;

/// What a router script produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    Resolved { node_id: String, output_args: Map<String, Value> },
    /// No destination. `shared_conditions` is free text for the LLM step.
    Unresolved { shared_conditions: Option<String> },
}

/// A destination chosen by the LLM with the arguments it extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmChoice {
    pub node_id: String,
    pub arguments: Map<String, Value>,
}

/// Run the router's script. Script failures resolve nothing; naming a node
/// that is not a child of this router is a routing error.
pub async fn run_script(
    blueprint: &Blueprint,
    router: &RouterNode,
    event: &Event,
    runtime: &BlueprintRuntime,
) -> Result<ScriptOutcome, RoutingError> {
    let Some(script) = &router.script else {
        return Ok(ScriptOutcome::Unresolved { shared_conditions: None });
    };
    let children = blueprint.children(&router.router_id);

    let mut bindings = runtime.context.lookup(event.aid(), event.uid()).await;
    bindings.insert("optional_child_node".into(), serde_json::json!(children));
    bindings.insert("trigger_event".into(), event.to_binding());
    bindings.insert("next_node".into(), Value::Null);
    bindings.insert("output_args".into(), Value::Object(Map::new()));
    bindings.insert("input_args".into(), Value::Object(router.params.values()));
    bindings.insert("shared_conditions".into(), Value::String(String::new()));

    let out = match runtime.evaluator.evaluate(script, bindings).await {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(
                bp_id = %blueprint.bp_id,
                router_id = %router.router_id,
                error = %e,
                "router script failed, no destination"
            );
            return Ok(ScriptOutcome::Unresolved { shared_conditions: None });
        }
    };

    let shared_conditions = match out.get("shared_conditions") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Null) | Some(Value::String(_)) | None => None,
        Some(other) => Some(other.to_string()),
    };
    let next = match out.get("next_node") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Ok(ScriptOutcome::Unresolved { shared_conditions }),
    };

    let node_id = children
        .iter()
        .find(|c| **c == next)
        .or_else(|| children.iter().find(|c| blueprint.local_name(c) == next))
        .map(|c| c.to_string())
        .ok_or_else(|| RoutingError::UnknownNode { router: router.router_id.clone(), node: next.clone() })?;
    let output_args = match out.get("output_args") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    Ok(ScriptOutcome::Resolved { node_id, output_args })
}

/// System prompt for LLM routing.
pub fn router_prompt(mission_purpose: &str, known_conditions: &str) -> String {
    format!(
        "##### Mission Purpose\n{mission_purpose}\n\n\
         ##### Known Conditions\n{known_conditions}\n\n\
         ##### Expected Output\n\
         You MUST select a function from the given functions"
    )
}

/// Ask the completion capability to pick one child of `router`. Empty or
/// malformed answers are retried up to the configured attempt budget.
pub async fn llm_route(
    blueprint: &Blueprint,
    router: &RouterNode,
    event: &Event,
    shared_conditions: Option<&str>,
    runtime: &BlueprintRuntime,
) -> Result<LlmChoice, RoutingError> {
    let Some(completion) = &runtime.completion else {
        return Err(RoutingError::Unresolved(router.router_id.clone()));
    };
    let functions = blueprint.child_functions(&router.router_id);
    if functions.is_empty() {
        return Err(RoutingError::Unresolved(router.router_id.clone()));
    }
    let tools: Vec<ToolDefinition> = functions.iter().map(|(_, f)| f.to_tool()).collect();

    let mut known_conditions: Vec<String> = runtime
        .memory
        .recent_events(runtime.limits.event_window)
        .await
        .iter()
        .map(Event::description)
        .collect();
    if let Some(shared) = shared_conditions {
        known_conditions.push(shared.to_string());
    }
    let prompt = router_prompt(&blueprint.description, &known_conditions.join("\n"));
    let context = [ChatMessage::user(event.description())];

    let mut last = String::from("no attempt made");
    for attempt in 1..=runtime.limits.max_attempts {
        let call = match completion.generate(&prompt, &context, &tools).await {
            Ok(Some(call)) => call,
            Ok(None) => {
                last = "no function chosen".into();
                tracing::warn!(bp_id = %blueprint.bp_id, router_id = %router.router_id, attempt, reason = %last, "llm routing attempt failed");
                continue;
            }
            Err(e) => {
                last = e.to_string();
                tracing::warn!(bp_id = %blueprint.bp_id, router_id = %router.router_id, attempt, reason = %last, "llm routing attempt failed");
                continue;
            }
        };

        let Some(position) = functions.iter().position(|(_, f)| f.name == call.name) else {
            return Err(RoutingError::UnknownNode { router: router.router_id.clone(), node: call.name });
        };
        let arguments = match &call.arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    last = format!("arguments are not an object: {}", preview(raw, 120));
                    tracing::warn!(bp_id = %blueprint.bp_id, router_id = %router.router_id, attempt, reason = %last, "llm routing attempt failed");
                    continue;
                }
            },
            other => {
                last = format!("arguments are not an object: {}", preview(&other.to_string(), 120));
                tracing::warn!(bp_id = %blueprint.bp_id, router_id = %router.router_id, attempt, reason = %last, "llm routing attempt failed");
                continue;
            }
        };
        if let Err(reason) = validate_arguments(&Value::Object(arguments.clone()), &tools[position].input_schema) {
            last = reason;
            tracing::warn!(bp_id = %blueprint.bp_id, router_id = %router.router_id, attempt, reason = %last, "llm routing attempt failed");
            continue;
        }

        let (node_id, _) = &functions[position];
        tracing::info!(bp_id = %blueprint.bp_id, router_id = %router.router_id, node_id = %node_id, attempt, "llm routed");
        return Ok(LlmChoice { node_id: node_id.clone(), arguments });
    }

    Err(RoutingError::Exhausted { attempts: runtime.limits.max_attempts, last })
}
