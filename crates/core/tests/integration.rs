//! End-to-end tests for the behavior engine.
//!
//! Everything runs without a database: catalogs are loaded from an
//! in-memory document, actions land on a queue the test drains.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Map, Value, json};
use soma_core::action::{ActionAtom, ActionProgram, ActionQueue, QueuedAction};
use soma_core::blueprint::{BlueprintRuntime, RouterLimits, StepResult};
use soma_core::capability::{CompletionClient, DecisionTableEvaluator, EventLog, FunctionCall, NoContext};
use soma_core::catalog::StaticCatalogSource;
use soma_core::config::SomaCfg;
use soma_core::runtime::Services;
use soma_core::strategy::{CandidateAction, Strategy, StrategyDefinition, StrategyManager, arbitrate};
use soma_core::types::{ConversationEvent, Event, SceneEvent};
use soma_llm::provider::{ChatMessage, LlmError, ToolDefinition};
use tokio::sync::mpsc;

const AID: &str = "ai-1";

fn scene(name: &str) -> Event {
    SceneEvent::new(AID, name).into()
}

fn chat(text: &str) -> Event {
    ConversationEvent::new(AID, "Ada", text).into()
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// Catalog document shared by the strategy tests. Every strategy points at
/// the same `wave` action; only their triggers and budgets differ.
fn strategy_catalog(strategies: Vec<Value>) -> Value {
    let ids: Vec<Value> = strategies.iter().map(|s| s["strategy_id"].clone()).collect();
    json!({
        "trigger": [
            {"trigger_id": "t_join", "kind": "scene", "event_name": "user_joined"},
            {"trigger_id": "t_user", "kind": "scene", "event_name": "user"},
        ],
        "action_atom": [{"atom_id": "emote", "action_type": "animation"}],
        "action_node": [{"node_id": "wave", "action_type": "atomic", "action_id": "emote"}],
        "strategy": strategies,
        "strategy_assignment": [{"aid": AID, "strategy_ids": ids}],
    })
}

fn strategy(id: &str, trigger: &str, extra: Value) -> Value {
    let mut def = json!({
        "strategy_id": id,
        "trigger_ids": [trigger],
        "actions": [{"target": {"kind": "action", "id": "wave"}}],
    });
    if let (Value::Object(def), Value::Object(extra)) = (&mut def, extra) {
        def.extend(extra);
    }
    def
}

async fn services(doc: Value) -> Arc<Services> {
    let source = Arc::new(StaticCatalogSource::from_document(doc).unwrap());
    let services = Services::new(SomaCfg::default(), source);
    assert_eq!(services.refresh_all().await, 4);
    Arc::new(services)
}

async fn manager(doc: Value) -> (StrategyManager, mpsc::Receiver<QueuedAction>) {
    let (queue, rx) = ActionQueue::channel(64);
    let manager = StrategyManager::new(AID, services(doc).await, queue).with_seed(7);
    manager.load();
    (manager, rx)
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[tokio::test]
async fn frequency_budget_limits_fires_and_unlimited_never_runs_out() {
    let doc = strategy_catalog(vec![
        strategy("s_three", "t_join", json!({"instance_frequency": 3})),
        strategy("s_forever", "t_join", json!({"instance_frequency": -1})),
    ]);
    let (manager, mut rx) = manager(doc).await;

    let mut fired: HashMap<String, usize> = HashMap::new();
    for _ in 0..6 {
        for id in manager.dispatch_scene_event(&scene("user_joined")).await.fired {
            *fired.entry(id).or_default() += 1;
        }
    }
    assert_eq!(fired["s_three"], 3);
    assert_eq!(fired["s_forever"], 6);
    assert!(!manager.is_bound("s_three"));
    assert!(manager.is_bound("s_forever"));

    let mut queued = 0;
    while rx.try_recv().is_ok() {
        queued += 1;
    }
    assert_eq!(queued, 9);
}

#[tokio::test]
async fn time_window_skips_early_and_retires_late() {
    let now = Utc::now();
    let doc = strategy_catalog(vec![
        strategy("s_early", "t_join", json!({"start_time": now + Duration::hours(1), "instance_frequency": -1})),
        strategy("s_late", "t_join", json!({"end_time": now - Duration::hours(1), "instance_frequency": -1})),
        strategy(
            "s_open",
            "t_join",
            json!({"start_time": now - Duration::hours(1), "end_time": now + Duration::hours(1)}),
        ),
    ]);
    let (manager, _rx) = manager(doc).await;

    let outcome = manager.dispatch_scene_event(&scene("user_joined")).await;
    assert_eq!(outcome.fired, vec!["s_open"]);
    assert!(manager.is_bound("s_early"));
    assert!(!manager.is_bound("s_late"));
}

#[tokio::test]
async fn only_best_priority_fires() {
    let doc = strategy_catalog(vec![
        strategy("s_a", "t_join", json!({"priority": 2})),
        strategy("s_b", "t_join", json!({"priority": 2})),
        strategy("s_c", "t_join", json!({"priority": 5})),
    ]);
    let (manager, _rx) = manager(doc).await;

    let outcome = manager.dispatch_scene_event(&scene("user_joined")).await;
    assert_eq!(sorted(outcome.fired), vec!["s_a", "s_b"]);
    assert!(manager.is_bound("s_c"));
}

#[test]
fn weighted_draw_follows_weights() {
    let make = |id: &str, weight: u32| {
        let mut def = StrategyDefinition::new(id, vec!["t".into()], vec![CandidateAction::action("wave")]);
        def.weight = Some(weight);
        Arc::new(Strategy::new(Arc::new(def)))
    };
    let light = make("light", 1);
    let heavy = make("heavy", 3);
    let mut rng = StdRng::seed_from_u64(2024);

    let trials = 10_000;
    let mut heavy_wins = 0;
    for _ in 0..trials {
        let fired = arbitrate(vec![light.clone(), heavy.clone()], &mut rng);
        assert_eq!(fired.len(), 1);
        if fired[0].id() == "heavy" {
            heavy_wins += 1;
        }
    }
    let share = heavy_wins as f64 / trials as f64;
    assert!((0.675..=0.825).contains(&share), "heavy share {share}");
}

#[test]
fn diamond_program_runs_by_frontier() {
    let graph = HashMap::from([
        ("a".to_string(), HashMap::from([("b".to_string(), HashMap::new()), ("c".to_string(), HashMap::new())])),
        ("b".to_string(), HashMap::from([("d".to_string(), HashMap::new())])),
        ("c".to_string(), HashMap::from([("d".to_string(), HashMap::new())])),
    ]);
    let atoms = ["a", "b", "c", "d"].map(|id| ActionAtom::new(id, "noop")).to_vec();
    let mut program = ActionProgram::new("diamond", atoms, graph).unwrap();
    let ids = |atoms: Vec<ActionAtom>| atoms.into_iter().map(|a| a.atom_id).collect::<Vec<_>>();

    assert_eq!(ids(program.ready_to_execute()), vec!["a"]);
    assert!(program.ready_to_execute().is_empty());
    program.complete("a", Map::new());
    assert_eq!(ids(program.ready_to_execute()), vec!["b", "c"]);

    program.complete("b", Map::new());
    assert!(program.ready_to_execute().is_empty());
    program.complete("c", Map::new());
    assert_eq!(ids(program.ready_to_execute()), vec!["d"]);

    assert!(!program.is_finished());
    program.complete("d", Map::new());
    assert!(program.is_finished());
}

#[tokio::test]
async fn scene_triggers_match_event_names_exactly() {
    let doc = strategy_catalog(vec![
        strategy("s_join", "t_join", json!({"instance_frequency": -1})),
        strategy("s_user", "t_user", json!({"instance_frequency": -1})),
    ]);
    let (manager, _rx) = manager(doc).await;

    assert!(manager.dispatch_scene_event(&scene("user_left")).await.fired.is_empty());
    assert_eq!(manager.dispatch_scene_event(&scene("user_joined")).await.fired, vec!["s_join"]);
    assert_eq!(manager.dispatch_scene_event(&scene("user")).await.fired, vec!["s_user"]);
}

/// Always answers with the same function.
struct Always(FunctionCall);

#[async_trait]
impl CompletionClient for Always {
    async fn generate(&self, _: &str, _: &[ChatMessage], _: &[ToolDefinition]) -> Result<Option<FunctionCall>, LlmError> {
        Ok(Some(self.0.clone()))
    }
}

fn blueprint_catalog() -> Value {
    json!({
        "action_atom": [
            {"atom_id": "ask_city", "action_type": "tts", "outputs": {"city": {"type": "string"}}},
            {"atom_id": "forecast", "action_type": "tts", "params": {"location": {"type": "string"}}},
        ],
        "action_node": [
            {"node_id": "ask", "action_type": "atomic", "action_id": "ask_city"},
            {"node_id": "answer", "action_type": "atomic", "action_id": "forecast"},
        ],
        "router": [
            {"router_id": "pick", "script_router":
                {"rules": [{"when": [{"path": "input_args.city", "op": "exists"}], "set": {"next_node": "answer"}}]},
             "llm_routing": false, "params": {"city": {"type": "string"}}},
            {"router_id": "hold", "router_name": "Hold", "description": "Keep waiting"},
        ],
        "blueprint": [
            {"bp_id": "weather", "name": "Weather", "description": "Tell the weather", "portal_node": "ask",
             "action_nodes": ["ask", "answer"], "router_nodes": ["pick"],
             "connections": {"ask": {"pick": {"city": "city"}}, "pick": {"answer": {"city": "location"}}}},
            {"bp_id": "chatty", "name": "Chatty", "description": "Wait for the user", "portal_node": "hold",
             "action_nodes": ["answer"], "router_nodes": ["hold"],
             "connections": {"hold": {"hold": {}, "answer": {}}},
             "node_names": {"hold": "Keep waiting", "answer": "Answer"}},
        ],
    })
}

fn runtime(
    services: &Services,
    completion: Option<Arc<dyn CompletionClient>>,
    limits: RouterLimits,
) -> (BlueprintRuntime, mpsc::Receiver<QueuedAction>) {
    let (queue, rx) = ActionQueue::channel(16);
    let runtime = BlueprintRuntime {
        queue,
        evaluator: Arc::new(DecisionTableEvaluator),
        completion,
        memory: Arc::new(EventLog::new(8)),
        context: Arc::new(NoContext),
        limits,
    };
    assert!(services.blueprints.contains("weather"));
    (runtime, rx)
}

#[tokio::test]
async fn action_outputs_cross_edge_remap_into_next_action() {
    let services = services(blueprint_catalog()).await;
    let (runtime, mut rx) = runtime(&services, None, RouterLimits::default());
    let mut bp = services.blueprints.instantiate("weather", runtime).unwrap();

    assert_eq!(bp.start(&scene("begin")).await.result, StepResult::Executed);
    assert_eq!(rx.recv().await.unwrap().node.node_id, "ask");

    bp.record_outputs("ask", object(json!({"city": "Paris"})));
    assert_eq!(bp.advance(&scene("tick")).await.result, StepResult::Finished);

    let answer = rx.recv().await.unwrap();
    assert_eq!(answer.node.node_id, "answer");
    assert_eq!(answer.node.params().get("location"), Some(&json!("Paris")));
    assert!(bp.is_terminated());
}

#[tokio::test]
async fn stalled_llm_router_cancels_itself() {
    let services = services(blueprint_catalog()).await;
    let stay = Arc::new(Always(FunctionCall { name: "Keep_waiting".into(), arguments: json!({}) }));
    let limits = RouterLimits { self_cancel_limit: 3, ..RouterLimits::default() };
    let (runtime, _rx) = runtime(&services, Some(stay), limits);
    let mut bp = services.blueprints.instantiate("chatty", runtime).unwrap();

    for turn in 1..=limits.self_cancel_limit + 1 {
        assert_eq!(bp.advance(&chat("hmm")).await.result, StepResult::Ignore, "turn {turn}");
        assert_eq!(bp.unactive_turns(), turn);
    }
    assert_eq!(bp.advance(&chat("hmm")).await.result, StepResult::SelfKill);
    assert!(bp.is_terminated());
    assert_eq!(bp.advance(&chat("still there?")).await.result, StepResult::SelfKill);
}
