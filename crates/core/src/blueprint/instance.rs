//! The per-activation graph walker.

use std::collections::HashMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::router::{llm_route, run_script, ScriptOutcome};
use super::{Blueprint, BlueprintNode, BlueprintRuntime, RouterNode};
use crate::action::{Origin, QueuedAction};
use crate::error::RoutingError;
use crate::schema::{remap_values, FunctionDescription, ParamSchema};
use crate::types::Event;

pub const CANCEL_FUNCTION: &str = "CancelCurrentBlueprintTask";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The event does not apply to the current router, or nothing resolved.
    Ignore,
    /// An action was enqueued and the walker moved on to its router.
    Executed,
    /// An action was enqueued and the graph ends there.
    Finished,
    /// The activation terminated itself.
    SelfKill,
}

impl StepResult {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepResult::Finished | StepResult::SelfKill)
    }
}

/// Outcome of one event, plus any functions the caller may offer its LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub result: StepResult,
    pub functions: Vec<FunctionDescription>,
}

impl From<StepResult> for Advance {
    fn from(result: StepResult) -> Self {
        Self { result, functions: Vec::new() }
    }
}

/// Where a routing decision came from. Decides how values cross the edge.
enum Decision {
    Script { node_id: String, output_args: Map<String, Value> },
    Llm { node_id: String, arguments: Map<String, Value> },
}

impl Decision {
    fn node_id(&self) -> &str {
        match self {
            Decision::Script { node_id, .. } | Decision::Llm { node_id, .. } => node_id,
        }
    }
}

/// Live walk of one blueprint. Owns fresh node instances and a current-node
/// pointer; the only cycle guard is the stall counter.
pub struct BlueprintInstance {
    pub instance_id: Uuid,
    blueprint: Blueprint,
    current: String,
    unactive_time_count: u32,
    outputs: HashMap<String, Map<String, Value>>,
    terminal: Option<StepResult>,
    runtime: BlueprintRuntime,
}

impl BlueprintInstance {
    pub fn new(blueprint: Blueprint, runtime: BlueprintRuntime) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            current: blueprint.portal.clone(),
            blueprint,
            unactive_time_count: 0,
            outputs: HashMap::new(),
            terminal: None,
            runtime,
        }
    }

    pub fn bp_id(&self) -> &str {
        &self.blueprint.bp_id
    }

    pub fn name(&self) -> &str {
        &self.blueprint.name
    }

    pub fn current_node(&self) -> &str {
        &self.current
    }

    pub fn unactive_turns(&self) -> u32 {
        self.unactive_time_count
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Bind values into the portal node.
    pub fn set_params(&mut self, values: &Map<String, Value>) -> usize {
        let portal = self.blueprint.portal.clone();
        self.blueprint.node_mut(&portal).map(|n| n.set_params(values)).unwrap_or(0)
    }

    pub fn function_description(&self) -> FunctionDescription {
        self.blueprint.function_description()
    }

    /// Offered to the caller's LLM while this activation waits on a router
    /// that only a conversation can move.
    pub fn cancel_function(&self) -> FunctionDescription {
        FunctionDescription::new(
            CANCEL_FUNCTION,
            format!(
                "Current blueprint task is: {}\nCall this function if the user directly indicates \
                 that they want to stop this task.",
                self.blueprint.description
            ),
            ParamSchema::new(),
        )
    }

    /// Report an executed action's outputs. They flow along the action's
    /// edge into the next router's inputs, by name when the edge has no remap.
    pub fn record_outputs(&mut self, node_id: &str, values: Map<String, Value>) {
        if let Some(router_id) = self.blueprint.next_router(node_id).map(str::to_string) {
            let mapped = self.across_edge(node_id, &router_id, values.clone());
            if let Some(router) = self.blueprint.node_mut(&router_id) {
                router.set_params(&mapped);
            }
        }
        self.outputs.insert(node_id.to_string(), values);
    }

    pub fn recorded_outputs(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.outputs.get(node_id)
    }

    /// First event of the activation. A portal action runs immediately.
    pub async fn start(&mut self, event: &Event) -> Advance {
        let portal = self.blueprint.portal.clone();
        match self.blueprint.node(&portal).map(BlueprintNode::is_router) {
            Some(false) => self.enter_action(&portal, event).await.into(),
            Some(true) => self.advance(event).await,
            None => self.kill("portal node vanished").into(),
        }
    }

    /// Feed one event to the walker.
    pub async fn advance(&mut self, event: &Event) -> Advance {
        if let Some(terminal) = self.terminal {
            return terminal.into();
        }
        let router = match self.blueprint.node(&self.current).cloned() {
            Some(BlueprintNode::Router(r)) => r,
            Some(BlueprintNode::Action(_)) => {
                let current = self.current.clone();
                return self.enter_action(&current, event).await.into();
            }
            None => return self.kill("current node vanished").into(),
        };

        if event.is_conversation() {
            if !router.llm_routing {
                return StepResult::Ignore.into();
            }
            self.unactive_time_count += 1;
            if self.unactive_time_count > self.runtime.limits.self_cancel_limit + 1 {
                return self.kill("stalled on an llm router").into();
            }
        } else if !router.has_script() {
            return Advance { result: StepResult::Ignore, functions: vec![self.cancel_function()] };
        }

        self.walk(router, event).await.into()
    }

    async fn walk(&mut self, mut router: RouterNode, event: &Event) -> StepResult {
        let mut hops = 0usize;
        loop {
            let decision = match self.route(&router, event).await {
                Ok(Some(decision)) => decision,
                Ok(None) => return StepResult::Ignore,
                Err(e) => return self.kill(&e.to_string()),
            };
            let target = decision.node_id().to_string();
            if target == router.router_id {
                return StepResult::Ignore;
            }
            self.unactive_time_count = 0;
            self.carry_values(&router, decision);

            match self.blueprint.node(&target).cloned() {
                Some(BlueprintNode::Router(next)) => {
                    hops += 1;
                    let max_hops = self.runtime.limits.max_hops;
                    if hops > max_hops {
                        return self.kill(&RoutingError::HopLimit(max_hops).to_string());
                    }
                    router = next;
                    self.current = target;
                }
                Some(BlueprintNode::Action(_)) => return self.enter_action(&target, event).await,
                None => return self.kill(&format!("routed to missing node {target}")),
            }
        }
    }

    /// Script first on scene events; LLM for conversation, or as the
    /// fallback when the script leaves no destination.
    async fn route(&self, router: &RouterNode, event: &Event) -> Result<Option<Decision>, RoutingError> {
        let mut shared_conditions = None;
        if !event.is_conversation() && router.has_script() {
            match run_script(&self.blueprint, router, event, &self.runtime).await? {
                ScriptOutcome::Resolved { node_id, output_args } => {
                    return Ok(Some(Decision::Script { node_id, output_args }));
                }
                ScriptOutcome::Unresolved { shared_conditions: shared } => shared_conditions = shared,
            }
        }
        if !router.llm_routing {
            return Ok(None);
        }
        let choice = llm_route(&self.blueprint, router, event, shared_conditions.as_deref(), &self.runtime).await?;
        Ok(Some(Decision::Llm { node_id: choice.node_id, arguments: choice.arguments }))
    }

    /// LLM arguments land on the destination as-is. Script outputs (over the
    /// router's own inputs) cross the edge remap, or go by name when the
    /// edge has none.
    fn carry_values(&mut self, router: &RouterNode, decision: Decision) {
        let (target, values) = match decision {
            Decision::Llm { node_id, arguments } => (node_id, arguments),
            Decision::Script { node_id, output_args } => {
                let mut upstream = router.params.values();
                upstream.extend(output_args);
                let values = self.across_edge(&router.router_id, &node_id, upstream);
                (node_id, values)
            }
        };
        if values.is_empty() {
            return;
        }
        if let Some(node) = self.blueprint.node_mut(&target) {
            let written = node.set_params(&values);
            tracing::debug!(bp_id = %self.blueprint.bp_id, node_id = %target, written, "carried values across edge");
        }
    }

    fn across_edge(&self, from: &str, to: &str, values: Map<String, Value>) -> Map<String, Value> {
        match self.blueprint.remap(from, to) {
            Some(remap) if !remap.is_empty() => remap_values(&values, remap),
            _ => values,
        }
    }

    async fn enter_action(&mut self, node_id: &str, event: &Event) -> StepResult {
        let Some(BlueprintNode::Action(node)) = self.blueprint.node(node_id) else {
            return self.kill(&format!("{node_id} is not an action node"));
        };
        let action = QueuedAction {
            node: node.clone(),
            event: event.clone(),
            origin: Origin::Blueprint { bp_id: self.blueprint.bp_id.clone(), instance_id: self.instance_id },
        };
        if let Err(e) = self.runtime.queue.enqueue(action).await {
            return self.kill(&e.to_string());
        }

        match self.blueprint.next_router(node_id).map(str::to_string) {
            Some(router_id) => {
                self.current = router_id;
                StepResult::Executed
            }
            None => {
                self.current = node_id.to_string();
                self.terminal = Some(StepResult::Finished);
                tracing::info!(bp_id = %self.blueprint.bp_id, instance_id = %self.instance_id, "blueprint finished");
                StepResult::Finished
            }
        }
    }

    fn kill(&mut self, reason: &str) -> StepResult {
        tracing::warn!(
            bp_id = %self.blueprint.bp_id,
            instance_id = %self.instance_id,
            node_id = %self.current,
            reason,
            "blueprint self-kill"
        );
        self.terminal = Some(StepResult::SelfKill);
        StepResult::SelfKill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionAtom, ActionNode, ActionQueue};
    use crate::blueprint::{Children, RouterLimits};
    use crate::capability::{CompletionClient, DecisionTableEvaluator, EventLog, FunctionCall, NoContext};
    use crate::schema::{ParamSlot, ParamType};
    use crate::types::{ConversationEvent, SceneEvent};
    use async_trait::async_trait;
    use serde_json::json;
    use soma_llm::provider::{ChatMessage, LlmError, ToolDefinition};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Always answers with the same function.
    struct Always(Mutex<Option<FunctionCall>>);

    #[async_trait]
    impl CompletionClient for Always {
        async fn generate(&self, _: &str, _: &[ChatMessage], _: &[ToolDefinition]) -> Result<Option<FunctionCall>, LlmError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn always(name: &str, arguments: Value) -> Arc<dyn CompletionClient> {
        Arc::new(Always(Mutex::new(Some(FunctionCall { name: name.into(), arguments }))))
    }

    fn edge(edges: &mut HashMap<String, Children>, from: &str, to: &str, remap: &[(&str, &str)]) {
        edges.entry(from.into()).or_default().insert(
            to.into(),
            remap.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect(),
        );
    }

    fn speak(id: &str) -> BlueprintNode {
        BlueprintNode::Action(ActionNode::atomic(
            id,
            ActionAtom::new(id, "tts").with_params(
                ParamSchema::new()
                    .with("location", ParamSlot::new(ParamType::String, "Where"))
                    .with("city", ParamSlot::new(ParamType::String, "City")),
            ),
        ))
    }

    fn runtime(completion: Option<Arc<dyn CompletionClient>>) -> (BlueprintRuntime, mpsc::Receiver<QueuedAction>) {
        let (queue, rx) = ActionQueue::channel(16);
        let runtime = BlueprintRuntime {
            queue,
            evaluator: Arc::new(DecisionTableEvaluator),
            completion,
            memory: Arc::new(EventLog::new(8)),
            context: Arc::new(NoContext),
            limits: RouterLimits { self_cancel_limit: 5, max_attempts: 3, event_window: 6, max_hops: 4 },
        };
        (runtime, rx)
    }

    fn chat(text: &str) -> Event {
        ConversationEvent::new("ai-1", "Ada", text).into()
    }

    fn scene(name: &str) -> Event {
        SceneEvent::new("ai-1", name).into()
    }

    /// ask -> r1 -> {answer -> r2 -> {bye}}
    fn two_step(mut r1: RouterNode) -> Blueprint {
        r1.params = ParamSchema::new().with("city", ParamSlot::new(ParamType::String, "City"));
        let mut edges = HashMap::new();
        edge(&mut edges, "ask", "r1", &[("city", "city")]);
        edge(&mut edges, "r1", "answer", &[("city", "location")]);
        edge(&mut edges, "answer", "r2", &[]);
        edge(&mut edges, "r2", "bye", &[]);
        Blueprint::new(
            "bp1",
            "ask",
            vec![
                speak("ask"),
                BlueprintNode::Router(r1),
                speak("answer"),
                BlueprintNode::Router(RouterNode::new("r2")),
                speak("bye"),
            ],
            edges,
        )
        .unwrap()
        .with_description("Weather", "Tell the user the weather")
    }

    #[tokio::test]
    async fn action_portal_runs_on_start() {
        let (runtime, mut rx) = runtime(None);
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1")), runtime);

        let step = bp.start(&scene("begin")).await;
        assert_eq!(step.result, StepResult::Executed);
        assert_eq!(bp.current_node(), "r1");
        assert_eq!(rx.recv().await.unwrap().node.node_id, "ask");
    }

    #[tokio::test]
    async fn recorded_outputs_feed_script_output_through_remap() {
        let script = json!({"rules": [{"when": [{"path": "input_args.city", "op": "exists"}],
                                        "set": {"next_node": "answer"}}]});
        let (runtime, mut rx) = runtime(None);
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1").with_script(script).script_only()), runtime);

        bp.start(&scene("begin")).await;
        rx.recv().await.unwrap();
        assert_eq!(bp.advance(&scene("tick")).await.result, StepResult::Ignore);

        bp.record_outputs("ask", json!({"city": "Paris"}).as_object().cloned().unwrap());
        assert_eq!(bp.advance(&scene("tick")).await.result, StepResult::Executed);
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.node.node_id, "answer");
        assert_eq!(queued.node.params().get("location"), Some(&json!("Paris")));
        assert_eq!(bp.current_node(), "r2");
    }

    #[tokio::test]
    async fn recorded_outputs_pass_by_name_without_remap() {
        let script = json!({"rules": [{"when": [{"path": "input_args.city", "op": "exists"}],
                                        "set": {"next_node": "answer"}}]});
        let mut r1 = RouterNode::new("r1").with_script(script).script_only();
        r1.params = ParamSchema::new().with("city", ParamSlot::new(ParamType::String, "City"));
        let mut edges = HashMap::new();
        edge(&mut edges, "ask", "r1", &[]);
        edge(&mut edges, "r1", "answer", &[("city", "location")]);
        let blueprint =
            Blueprint::new("bp2", "ask", vec![speak("ask"), BlueprintNode::Router(r1), speak("answer")], edges).unwrap();
        let (runtime, mut rx) = runtime(None);
        let mut bp = BlueprintInstance::new(blueprint, runtime);

        bp.start(&scene("begin")).await;
        rx.recv().await.unwrap();
        bp.record_outputs("ask", json!({"city": "Lima"}).as_object().cloned().unwrap());
        assert_eq!(bp.advance(&scene("tick")).await.result, StepResult::Finished);
        assert_eq!(rx.recv().await.unwrap().node.params().get("location"), Some(&json!("Lima")));
    }

    #[tokio::test]
    async fn llm_arguments_land_on_destination() {
        let (runtime, mut rx) = runtime(Some(always("answer", json!({"city": "Oslo"}))));
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1")), runtime);
        bp.start(&scene("begin")).await;
        rx.recv().await.unwrap();

        assert_eq!(bp.advance(&chat("Oslo please")).await.result, StepResult::Executed);
        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.node.params().get("city"), Some(&json!("Oslo")));
        assert_eq!(bp.unactive_turns(), 0);
    }

    #[tokio::test]
    async fn script_only_router_ignores_conversation() {
        let script = json!({"rules": [{"set": {"next_node": "answer"}}]});
        let (runtime, _rx) = runtime(None);
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1").with_script(script).script_only()), runtime);
        bp.start(&scene("begin")).await;
        assert_eq!(bp.advance(&chat("hello")).await.result, StepResult::Ignore);
        assert_eq!(bp.unactive_turns(), 0);
    }

    #[tokio::test]
    async fn llm_only_router_offers_cancel_on_scene_events() {
        let (runtime, _rx) = runtime(None);
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1")), runtime);
        bp.start(&scene("begin")).await;

        let step = bp.advance(&scene("tick")).await;
        assert_eq!(step.result, StepResult::Ignore);
        assert_eq!(step.functions.len(), 1);
        assert_eq!(step.functions[0].name, CANCEL_FUNCTION);
        assert!(step.functions[0].description.contains("Tell the user the weather"));
    }

    #[tokio::test]
    async fn finishing_action_terminates() {
        let (runtime, mut rx) = runtime(Some(always("answer", json!({}))));
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1")), runtime);
        bp.start(&scene("begin")).await;
        assert_eq!(bp.advance(&chat("go")).await.result, StepResult::Executed);
        bp.runtime.completion = Some(always("bye", json!({})));
        assert_eq!(bp.advance(&chat("bye")).await.result, StepResult::Finished);
        assert!(bp.is_terminated());
        assert_eq!(bp.advance(&chat("again")).await.result, StepResult::Finished);

        let ids: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|q| q.node.node_id).collect();
        assert_eq!(ids, vec!["ask", "answer", "bye"]);
    }

    #[tokio::test]
    async fn routing_failure_self_kills() {
        let (runtime, _rx) = runtime(Some(always("teleport", json!({}))));
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1")), runtime);
        bp.start(&scene("begin")).await;
        assert_eq!(bp.advance(&chat("hm")).await.result, StepResult::SelfKill);
        assert!(bp.is_terminated());
    }

    #[tokio::test]
    async fn router_chain_respects_hop_limit() {
        let hop = |to: &str| json!({"rules": [{"set": {"next_node": to}}]});
        let mut edges = HashMap::new();
        edge(&mut edges, "r_a", "r_b", &[]);
        edge(&mut edges, "r_b", "r_a", &[]);
        let blueprint = Blueprint::new(
            "loop",
            "r_a",
            vec![
                BlueprintNode::Router(RouterNode::new("r_a").with_script(hop("r_b")).script_only()),
                BlueprintNode::Router(RouterNode::new("r_b").with_script(hop("r_a")).script_only()),
            ],
            edges,
        )
        .unwrap();
        let (runtime, _rx) = runtime(None);
        let mut bp = BlueprintInstance::new(blueprint, runtime);
        assert_eq!(bp.start(&scene("spin")).await.result, StepResult::SelfKill);
    }

    #[tokio::test]
    async fn function_description_uses_portal_inputs() {
        let (runtime, _rx) = runtime(None);
        let mut bp = BlueprintInstance::new(two_step(RouterNode::new("r1")), runtime);
        bp.set_params(json!({"city": "Rome"}).as_object().unwrap());
        let f = bp.function_description();
        assert_eq!(f.name, "Weather");
        assert_eq!(f.parameters.get("city"), Some(&json!("Rome")));
    }
}
