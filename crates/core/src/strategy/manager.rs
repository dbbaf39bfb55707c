//! Per-AI-instance strategy binding and event dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{arbitrate, CandidateAction, Eligibility, Strategy, TargetKind};
use crate::action::{ActionQueue, Origin, QueuedAction};
use crate::blueprint::BlueprintInstance;
use crate::capability::EventLog;
use crate::runtime::Services;
use crate::schema::FunctionDescription;
use crate::trigger::{SemanticMatcher, Trigger};
use crate::types::Event;

const EVENT_LOG_CAPACITY: usize = 128;

/// A strategy offered to the caller's LLM after a conversational turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub strategy_id: String,
    pub function: FunctionDescription,
}

/// What firing a strategy produced.
pub enum Activation {
    /// An action node went straight to the action queue.
    Enqueued { node_id: String },
    /// A fresh blueprint activation. The caller starts and drives it.
    Blueprint(BlueprintInstance),
}

/// Result of one scene event.
#[derive(Default)]
pub struct DispatchOutcome {
    /// Strategy ids that fired, in firing order.
    pub fired: Vec<String>,
    /// Action node ids handed to the queue.
    pub enqueued: Vec<String>,
    pub blueprints: Vec<BlueprintInstance>,
}

#[derive(Default)]
struct Bindings {
    strategies: HashMap<String, Arc<Strategy>>,
    /// trigger id -> bound strategy ids, in bind order.
    by_trigger: HashMap<String, Vec<String>>,
    /// Copies of the triggers in use, pinned against registry refreshes.
    triggers: HashMap<String, Arc<Trigger>>,
    /// event name -> scene trigger ids.
    scene_index: HashMap<String, Vec<String>>,
    lui_triggers: Vec<String>,
}

/// Strategies bound into one AI instance, indexed by trigger.
pub struct StrategyManager {
    aid: String,
    services: Arc<Services>,
    queue: ActionQueue,
    memory: Arc<EventLog>,
    matcher: SemanticMatcher,
    rng: Mutex<StdRng>,
    bindings: RwLock<Bindings>,
}

impl StrategyManager {
    pub fn new(aid: impl Into<String>, services: Arc<Services>, queue: ActionQueue) -> Self {
        Self {
            aid: aid.into(),
            matcher: services.matcher(),
            services,
            queue,
            memory: Arc::new(EventLog::new(EVENT_LOG_CAPACITY)),
            rng: Mutex::new(StdRng::from_entropy()),
            bindings: RwLock::new(Bindings::default()),
        }
    }

    /// Deterministic sampling, for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)), ..self }
    }

    pub fn aid(&self) -> &str {
        &self.aid
    }

    pub fn memory(&self) -> Arc<EventLog> {
        self.memory.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Bindings> {
        self.bindings.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Bindings> {
        self.bindings.write().unwrap_or_else(|e| e.into_inner())
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bound_strategies(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().strategies.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_bound(&self, strategy_id: &str) -> bool {
        self.read().strategies.contains_key(strategy_id)
    }

    pub fn lui_triggers(&self) -> Vec<String> {
        self.read().lui_triggers.clone()
    }

    pub fn scene_triggers(&self, event_name: &str) -> Vec<String> {
        self.read().scene_index.get(event_name).cloned().unwrap_or_default()
    }

    /// Replace all bindings with this instance's assigned strategies.
    /// Returns the number of strategies bound to at least one trigger.
    pub fn load(&self) -> usize {
        let ids = self.services.strategies.strategy_ids_for(&self.aid);
        let strategies = self.services.strategies.materialize(&ids);
        *self.write() = Bindings::default();

        let bound = strategies
            .into_iter()
            .map(Arc::new)
            .filter(|s| self.bind_trigger(s.clone()) > 0)
            .count();
        tracing::info!(aid = %self.aid, assigned = ids.len(), bound, "strategies loaded");
        bound
    }

    /// Register `strategy` under each of its triggers. Triggers missing from
    /// the registry are skipped. Returns the number of triggers bound.
    pub fn bind_trigger(&self, strategy: Arc<Strategy>) -> usize {
        let mut resolved = Vec::with_capacity(strategy.trigger_ids().len());
        for trigger_id in strategy.trigger_ids() {
            match self.services.triggers.get_trigger(trigger_id) {
                Some(trigger) => resolved.push(trigger),
                None => tracing::warn!(
                    aid = %self.aid,
                    strategy_id = %strategy.id(),
                    trigger_id = %trigger_id,
                    "trigger missing from registry, skipping"
                ),
            }
        }
        if resolved.is_empty() {
            tracing::warn!(aid = %self.aid, strategy_id = %strategy.id(), "strategy has no usable trigger, not bound");
            return 0;
        }

        let mut guard = self.write();
        let b = &mut *guard;
        for trigger in &resolved {
            let trigger_id = &trigger.trigger_id;
            let bound = b.by_trigger.entry(trigger_id.clone()).or_default();
            if !bound.iter().any(|s| s == strategy.id()) {
                bound.push(strategy.id().to_string());
            }
            if b.triggers.contains_key(trigger_id) {
                continue;
            }
            if let Some(event_name) = trigger.event_name() {
                b.scene_index.entry(event_name.to_string()).or_default().push(trigger_id.clone());
            } else if trigger.is_semantic() {
                b.lui_triggers.push(trigger_id.clone());
            }
            b.triggers.insert(trigger_id.clone(), trigger.clone());
        }
        b.strategies.insert(strategy.id().to_string(), strategy);
        resolved.len()
    }

    /// Remove a strategy from every trigger. Triggers left without any
    /// strategy are dropped from the scene index and the LUI list.
    pub fn unbind_trigger(&self, strategy_id: &str) -> bool {
        let mut guard = self.write();
        let b = &mut *guard;
        let Some(strategy) = b.strategies.remove(strategy_id) else {
            return false;
        };
        for trigger_id in strategy.trigger_ids() {
            let Some(bound) = b.by_trigger.get_mut(trigger_id) else {
                continue;
            };
            bound.retain(|s| s != strategy_id);
            if !bound.is_empty() {
                continue;
            }
            b.by_trigger.remove(trigger_id);
            if let Some(trigger) = b.triggers.remove(trigger_id)
                && let Some(event_name) = trigger.event_name()
                && let Some(ids) = b.scene_index.get_mut(event_name)
            {
                ids.retain(|t| t != trigger_id);
                if ids.is_empty() {
                    b.scene_index.remove(event_name);
                }
            }
            b.lui_triggers.retain(|t| t != trigger_id);
        }
        true
    }

    fn retire(&self, strategy: &Strategy, reason: &'static str) {
        if self.unbind_trigger(strategy.id()) {
            tracing::info!(aid = %self.aid, strategy_id = %strategy.id(), reason, "strategy retired");
        }
    }

    /// Strategies behind `trigger_ids`, deduplicated in first-seen order.
    fn strategies_for(&self, trigger_ids: &[String]) -> Vec<Arc<Strategy>> {
        let b = self.read();
        let mut seen = HashSet::new();
        trigger_ids
            .iter()
            .filter_map(|t| b.by_trigger.get(t))
            .flatten()
            .filter(|sid| seen.insert(sid.as_str()))
            .filter_map(|sid| b.strategies.get(sid).cloned())
            .collect()
    }

    /// Evaluate the scene triggers registered for the event, arbitrate among
    /// the executable strategies and fire the winners.
    pub async fn dispatch_scene_event(&self, event: &Event) -> DispatchOutcome {
        self.memory.record(event.clone());
        let mut outcome = DispatchOutcome::default();
        let Event::Scene(scene) = event else {
            return outcome;
        };

        let triggers: Vec<Arc<Trigger>> = {
            let b = self.read();
            b.scene_index
                .get(&scene.event_name)
                .map(|ids| ids.iter().filter_map(|id| b.triggers.get(id).cloned()).collect())
                .unwrap_or_default()
        };
        if triggers.is_empty() {
            return outcome;
        }

        let context = self.services.context.lookup(&self.aid, event.uid()).await;
        let hits = self.evaluate_scene_triggers(triggers, event, &context).await;
        let candidates = self.strategies_for(&hits);

        let now = Utc::now();
        let mut executable = Vec::new();
        let mut retired = Vec::new();
        {
            let mut rng = self.rng();
            for strategy in candidates {
                match strategy.eval(now, &mut *rng) {
                    Eligibility::Executable => executable.push(strategy),
                    Eligibility::Skip => {}
                    Eligibility::Retire => retired.push(strategy),
                }
            }
        }
        for strategy in &retired {
            let reason = if strategy.is_expired(now) { "expired" } else { "exhausted" };
            self.retire(strategy, reason);
        }

        let executable_count = executable.len();
        let firing = arbitrate(executable, &mut *self.rng());
        for strategy in firing {
            let target = strategy.pick_action(&mut *self.rng()).cloned();
            let Some(target) = target else { continue };
            let origin = Origin::Strategy { strategy_id: strategy.id().to_string() };
            match self.fire(&strategy, &target, event, origin, None).await {
                Some(Activation::Enqueued { node_id }) => outcome.enqueued.push(node_id),
                Some(Activation::Blueprint(instance)) => outcome.blueprints.push(instance),
                None => continue,
            }
            outcome.fired.push(strategy.id().to_string());
        }

        tracing::info!(
            aid = %self.aid,
            event_name = %scene.event_name,
            matched = hits.len(),
            executable = executable_count,
            fired = ?outcome.fired,
            "scene event dispatched"
        );
        outcome
    }

    /// Trigger ids that evaluated true, in registration order. Above the
    /// parallel threshold the evaluations run on a bounded pool.
    async fn evaluate_scene_triggers(
        &self,
        triggers: Vec<Arc<Trigger>>,
        event: &Event,
        context: &Map<String, Value>,
    ) -> Vec<String> {
        let cfg = &self.services.cfg;
        if triggers.len() <= cfg.scene_parallel_threshold {
            let mut hits = Vec::new();
            for trigger in triggers {
                if trigger.evaluate_scene(event, &*self.services.evaluator, context).await {
                    hits.push(trigger.trigger_id.clone());
                }
            }
            return hits;
        }

        let permits = Arc::new(Semaphore::new(cfg.scene_eval_workers.max(1)));
        let event = Arc::new(event.clone());
        let context = Arc::new(context.clone());
        let mut tasks = JoinSet::new();
        for trigger in &triggers {
            let trigger = trigger.clone();
            let evaluator = self.services.evaluator.clone();
            let (permits, event, context) = (permits.clone(), event.clone(), context.clone());
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return None;
                };
                trigger
                    .evaluate_scene(&event, &*evaluator, &context)
                    .await
                    .then(|| trigger.trigger_id.clone())
            });
        }

        let mut hit_set = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(trigger_id)) => {
                    hit_set.insert(trigger_id);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "scene trigger evaluation task failed"),
            }
        }
        triggers
            .iter()
            .filter(|t| hit_set.contains(&t.trigger_id))
            .map(|t| t.trigger_id.clone())
            .collect()
    }

    /// Match the turn against this instance's LUI triggers and return the
    /// strategies behind them as functions for the caller's LLM. No
    /// arbitration applies.
    pub async fn dispatch_conversation_event(&self, event: &Event) -> Vec<Candidate> {
        self.memory.record(event.clone());
        let Event::Conversation(turn) = event else {
            return Vec::new();
        };
        let lui = self.lui_triggers();
        if lui.is_empty() {
            return Vec::new();
        }

        let matched = self.matcher.match_text(&turn.message, &lui).await;
        let strategies: Vec<Arc<Strategy>> = {
            let b = self.read();
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for trigger_id in &matched {
                let Some(bound) = b.by_trigger.get(trigger_id) else { continue };
                if bound.len() > 1 {
                    tracing::warn!(
                        aid = %self.aid,
                        trigger_id = %trigger_id,
                        bound = bound.len(),
                        "semantic trigger bound to several strategies, using the first"
                    );
                }
                if let Some(strategy_id) = bound.first()
                    && seen.insert(strategy_id.clone())
                    && let Some(strategy) = b.strategies.get(strategy_id)
                {
                    out.push(strategy.clone());
                }
            }
            out
        };

        let now = Utc::now();
        let mut candidates = Vec::new();
        for strategy in strategies {
            if strategy.is_expired(now) {
                self.retire(&strategy, "expired");
                continue;
            }
            if strategy.is_exhausted() {
                self.retire(&strategy, "exhausted");
                continue;
            }
            if !strategy.has_started(now) {
                continue;
            }
            if let Some(function) = self.describe(&strategy) {
                candidates.push(Candidate { strategy_id: strategy.id().to_string(), function });
            }
        }
        tracing::debug!(aid = %self.aid, matched = matched.len(), candidates = candidates.len(), "conversation event dispatched");
        candidates
    }

    fn describe(&self, strategy: &Strategy) -> Option<FunctionDescription> {
        let target = strategy.described_action()?;
        let described = match target.target.kind {
            TargetKind::Action => self.services.actions.resolve(&target.target.id).map(|n| n.function_description()),
            TargetKind::Blueprint => self.services.blueprints.build(&target.target.id).map(|b| b.function_description()),
        };
        match described {
            Ok(function) => Some(function),
            Err(e) => {
                tracing::warn!(aid = %self.aid, strategy_id = %strategy.id(), error = %e, "cannot describe strategy");
                None
            }
        }
    }

    /// Fire a strategy the caller's LLM picked from
    /// [`dispatch_conversation_event`](Self::dispatch_conversation_event)'s
    /// candidates, binding the extracted arguments.
    pub async fn activate_strategy(
        &self,
        strategy_id: &str,
        event: &Event,
        arguments: &Map<String, Value>,
    ) -> Option<Activation> {
        let Some(strategy) = self.read().strategies.get(strategy_id).cloned() else {
            tracing::warn!(aid = %self.aid, strategy_id, "activation requested for unbound strategy");
            return None;
        };
        let now = Utc::now();
        if strategy.is_expired(now) {
            self.retire(&strategy, "expired");
            return None;
        }
        if !strategy.has_started(now) {
            tracing::debug!(aid = %self.aid, strategy_id, "activation requested before start_time");
            return None;
        }
        let target = strategy.described_action()?.clone();
        let origin = Origin::Activation { strategy_id: strategy_id.to_string() };
        self.fire(&strategy, &target, event, origin, Some(arguments)).await
    }

    /// Consume one use, then resolve and hand off the target.
    async fn fire(
        &self,
        strategy: &Strategy,
        target: &CandidateAction,
        event: &Event,
        origin: Origin,
        arguments: Option<&Map<String, Value>>,
    ) -> Option<Activation> {
        match strategy.consume() {
            None => {
                self.retire(strategy, "exhausted");
                return None;
            }
            Some(true) => self.retire(strategy, "exhausted"),
            Some(false) => {}
        }

        let target_id = &target.target.id;
        match target.target.kind {
            TargetKind::Action => {
                let mut node = match self.services.actions.resolve(target_id) {
                    Ok(node) => node,
                    Err(e) => {
                        tracing::warn!(aid = %self.aid, strategy_id = %strategy.id(), error = %e, "cannot resolve action");
                        return None;
                    }
                };
                if let Some(arguments) = arguments {
                    node.set_params(arguments);
                }
                let node_id = node.node_id.clone();
                if let Err(e) = self.queue.enqueue(QueuedAction { node, event: event.clone(), origin }).await {
                    tracing::warn!(aid = %self.aid, strategy_id = %strategy.id(), error = %e, "cannot enqueue action");
                    return None;
                }
                Some(Activation::Enqueued { node_id })
            }
            TargetKind::Blueprint => {
                let runtime = self.services.blueprint_runtime(self.queue.clone(), self.memory.clone());
                match self.services.blueprints.instantiate(target_id, runtime) {
                    Ok(mut instance) => {
                        if let Some(arguments) = arguments {
                            instance.set_params(arguments);
                        }
                        Some(Activation::Blueprint(instance))
                    }
                    Err(e) => {
                        tracing::warn!(aid = %self.aid, strategy_id = %strategy.id(), error = %e, "cannot build blueprint");
                        None
                    }
                }
            }
        }
    }
}
