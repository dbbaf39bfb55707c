//! Strategies: rules that bind triggers to candidate actions or blueprints,
//! with eligibility (time window, possibility, frequency) and arbitration
//! metadata.

pub mod arbitration;
pub mod manager;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::Deserialize;

use crate::catalog::{parse_definitions, CatalogSource, DefinitionKind, Refreshable, Snapshot};
use crate::error::{CatalogError, DefinitionError};

pub use arbitration::arbitrate;
pub use manager::{Activation, Candidate, DispatchOutcome, StrategyManager};

/// Remaining-use value meaning "no limit".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Action,
    Blueprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionTarget {
    pub kind: TargetKind,
    pub id: String,
}

/// One action or blueprint a strategy may run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CandidateAction {
    pub target: ActionTarget,
    #[serde(default)]
    pub weight: Option<u32>,
    /// Supplies the strategy's LLM-facing function description.
    #[serde(default)]
    pub describe_for_llm: bool,
}

impl CandidateAction {
    pub fn action(id: impl Into<String>) -> Self {
        Self { target: ActionTarget { kind: TargetKind::Action, id: id.into() }, weight: None, describe_for_llm: false }
    }

    pub fn blueprint(id: impl Into<String>) -> Self {
        Self { target: ActionTarget { kind: TargetKind::Blueprint, id: id.into() }, weight: None, describe_for_llm: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyDefinition {
    pub strategy_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Smaller is higher.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_frequency")]
    pub instance_frequency: i64,
    #[serde(default = "default_possibility")]
    pub possibility: u8,
    #[serde(default)]
    pub weight: Option<u32>,
    pub trigger_ids: Vec<String>,
    pub actions: Vec<CandidateAction>,
}

fn default_frequency() -> i64 {
    1
}

fn default_possibility() -> u8 {
    100
}

impl StrategyDefinition {
    pub fn new(strategy_id: impl Into<String>, trigger_ids: Vec<String>, actions: Vec<CandidateAction>) -> Self {
        let strategy_id = strategy_id.into();
        Self {
            name: strategy_id.clone(),
            strategy_id,
            description: String::new(),
            priority: 0,
            start_time: None,
            end_time: None,
            instance_frequency: default_frequency(),
            possibility: default_possibility(),
            weight: None,
            trigger_ids,
            actions,
        }
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        if self.strategy_id.trim().is_empty() {
            return Err(DefinitionError::invalid("strategy_id", "must not be empty"));
        }
        if self.trigger_ids.is_empty() {
            return Err(DefinitionError::invalid("trigger_ids", "needs at least one trigger"));
        }
        if self.actions.is_empty() {
            return Err(DefinitionError::invalid("actions", "needs at least one candidate action"));
        }
        if self.instance_frequency < UNLIMITED {
            return Err(DefinitionError::invalid("instance_frequency", format!("{} is below -1", self.instance_frequency)));
        }
        if !(1..=100).contains(&self.possibility) {
            return Err(DefinitionError::invalid("possibility", format!("{} is outside 1..=100", self.possibility)));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time)
            && start > end
        {
            return Err(DefinitionError::invalid("end_time", "precedes start_time"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyPackage {
    pub package_id: String,
    #[serde(default)]
    pub strategy_ids: Vec<String>,
}

/// Which strategies an AI instance runs, directly or through packages.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyAssignment {
    pub aid: String,
    #[serde(default)]
    pub strategy_ids: Vec<String>,
    #[serde(default)]
    pub package_ids: Vec<String>,
}

/// Result of one eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Executable,
    /// Not this time (window not open yet, possibility roll failed).
    Skip,
    /// Past its end time or out of uses. Unbind it.
    Retire,
}

/// A strategy bound into one AI instance. Owns that instance's remaining-use
/// counter; the definition itself is shared.
#[derive(Debug)]
pub struct Strategy {
    def: Arc<StrategyDefinition>,
    remaining: AtomicI64,
}

impl Strategy {
    pub fn new(def: Arc<StrategyDefinition>) -> Self {
        let remaining = AtomicI64::new(def.instance_frequency);
        Self { def, remaining }
    }

    pub fn id(&self) -> &str {
        &self.def.strategy_id
    }

    pub fn definition(&self) -> &StrategyDefinition {
        &self.def
    }

    pub fn priority(&self) -> i64 {
        self.def.priority
    }

    /// Arbitration weight. Zero counts as unset.
    pub fn weight(&self) -> Option<u32> {
        self.def.weight.filter(|w| *w > 0)
    }

    pub fn trigger_ids(&self) -> &[String] {
        &self.def.trigger_ids
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.def.end_time.is_some_and(|end| now > end)
    }

    fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.def.start_time.is_none_or(|start| now >= start)
    }

    pub fn eval<R: Rng + ?Sized>(&self, now: DateTime<Utc>, rng: &mut R) -> Eligibility {
        if self.is_expired(now) || self.is_exhausted() {
            return Eligibility::Retire;
        }
        if !self.has_started(now) {
            return Eligibility::Skip;
        }
        if self.def.possibility < 100 && rng.gen_range(1..=100u8) > self.def.possibility {
            return Eligibility::Skip;
        }
        Eligibility::Executable
    }

    /// Take one use. `None` when nothing was left; otherwise whether this
    /// use was the last one.
    pub fn consume(&self) -> Option<bool> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                UNLIMITED => Some(UNLIMITED),
                n if n > 0 => Some(n - 1),
                _ => None,
            })
            .ok()
            .map(|previous| previous == 1)
    }

    /// Weighted pick among candidate actions. Unweighted candidates weigh 1.
    pub fn pick_action<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&CandidateAction> {
        let actions = &self.def.actions;
        if actions.len() > 1
            && let Ok(dist) = WeightedIndex::new(actions.iter().map(|a| a.weight.filter(|w| *w > 0).map_or(1, u64::from)))
        {
            return actions.get(dist.sample(rng));
        }
        actions.first()
    }

    /// The candidate that describes this strategy to an LLM: the first one
    /// flagged, else the first one.
    pub fn described_action(&self) -> Option<&CandidateAction> {
        self.def
            .actions
            .iter()
            .find(|a| a.describe_for_llm)
            .or_else(|| self.def.actions.first())
    }
}

#[derive(Debug, Default)]
struct StrategyDefinitions {
    strategies: HashMap<String, Arc<StrategyDefinition>>,
    packages: HashMap<String, StrategyPackage>,
    assignments: HashMap<String, StrategyAssignment>,
}

/// Live strategy, package and assignment definitions.
pub struct StrategyCatalog {
    source: Arc<dyn CatalogSource>,
    snapshot: Snapshot<StrategyDefinitions>,
}

impl StrategyCatalog {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source, snapshot: Snapshot::default() }
    }

    pub fn get(&self, strategy_id: &str) -> Option<Arc<StrategyDefinition>> {
        self.snapshot.load().strategies.get(strategy_id).cloned()
    }

    /// Effective strategy ids for `aid`: package members first, then direct
    /// assignments, deduplicated in first-seen order.
    pub fn strategy_ids_for(&self, aid: &str) -> Vec<String> {
        let defs = self.snapshot.load();
        let Some(assignment) = defs.assignments.get(aid) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for package_id in &assignment.package_ids {
            match defs.packages.get(package_id) {
                Some(package) => ids.extend(package.strategy_ids.iter().cloned()),
                None => tracing::warn!(aid, package_id = %package_id, "strategy package not found"),
            }
        }
        ids.extend(assignment.strategy_ids.iter().cloned());
        ids.retain(|id| seen.insert(id.clone()));
        ids
    }

    /// Fresh bound strategies, each with its own use counter. Unknown ids are
    /// logged and skipped.
    pub fn materialize(&self, strategy_ids: &[String]) -> Vec<Strategy> {
        let defs = self.snapshot.load();
        strategy_ids
            .iter()
            .filter_map(|id| match defs.strategies.get(id) {
                Some(def) => Some(Strategy::new(def.clone())),
                None => {
                    tracing::warn!(strategy_id = %id, "strategy not found in catalog");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Refreshable for StrategyCatalog {
    fn name(&self) -> &'static str {
        "strategies"
    }

    async fn refresh(&self) -> Result<usize, CatalogError> {
        let strategies_raw = self.source.load_all(DefinitionKind::Strategy).await?;
        let packages_raw = self.source.load_all(DefinitionKind::StrategyPackage).await?;
        let assignments_raw = self.source.load_all(DefinitionKind::StrategyAssignment).await?;

        let defs = StrategyDefinitions {
            strategies: parse_definitions(DefinitionKind::Strategy, strategies_raw, StrategyDefinition::validate)
                .into_iter()
                .map(|d: StrategyDefinition| (d.strategy_id.clone(), Arc::new(d)))
                .collect(),
            packages: parse_definitions(DefinitionKind::StrategyPackage, packages_raw, |_: &StrategyPackage| Ok(()))
                .into_iter()
                .map(|p| (p.package_id.clone(), p))
                .collect(),
            assignments: parse_definitions(
                DefinitionKind::StrategyAssignment,
                assignments_raw,
                |_: &StrategyAssignment| Ok(()),
            )
            .into_iter()
            .map(|a| (a.aid.clone(), a))
            .collect(),
        };
        let count = defs.strategies.len();
        self.snapshot.store(defs);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalogSource;
    use chrono::Duration;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    fn strategy(frequency: i64) -> Strategy {
        let mut def = StrategyDefinition::new("s1", vec!["t1".into()], vec![CandidateAction::action("n1")]);
        def.instance_frequency = frequency;
        Strategy::new(Arc::new(def))
    }

    #[test]
    fn pick_action_handles_huge_weights() {
        let heavy = |id: &str| CandidateAction { weight: Some(u32::MAX), ..CandidateAction::action(id) };
        let def = StrategyDefinition::new("s", vec!["t".into()], vec![heavy("a"), heavy("b"), heavy("c")]);
        let strategy = Strategy::new(Arc::new(def));
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let picked = strategy.pick_action(&mut rng).unwrap();
            assert!(["a", "b", "c"].contains(&picked.target.id.as_str()));
        }
    }

    #[test]
    fn consume_counts_down_to_exhaustion() {
        let s = strategy(2);
        assert_eq!(s.consume(), Some(false));
        assert_eq!(s.consume(), Some(true));
        assert_eq!(s.consume(), None);
        assert!(s.is_exhausted());
    }

    #[test]
    fn unlimited_never_exhausts() {
        let s = strategy(UNLIMITED);
        for _ in 0..1000 {
            assert_eq!(s.consume(), Some(false));
        }
        assert_eq!(s.remaining(), UNLIMITED);
    }

    #[test]
    fn eval_respects_window() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);
        let mut def = StrategyDefinition::new("s", vec!["t".into()], vec![CandidateAction::action("n")]);
        def.start_time = Some(now + Duration::hours(1));
        assert_eq!(Strategy::new(Arc::new(def.clone())).eval(now, &mut rng), Eligibility::Skip);

        def.start_time = None;
        def.end_time = Some(now - Duration::seconds(1));
        assert_eq!(Strategy::new(Arc::new(def)).eval(now, &mut rng), Eligibility::Retire);

        assert_eq!(strategy(0).eval(now, &mut rng), Eligibility::Retire);
        assert_eq!(strategy(1).eval(now, &mut rng), Eligibility::Executable);
    }

    #[test]
    fn possibility_gates_roughly_proportionally() {
        let mut def = StrategyDefinition::new("s", vec!["t".into()], vec![CandidateAction::action("n")]);
        def.possibility = 30;
        let s = Strategy::new(Arc::new(def));
        let mut rng = StdRng::seed_from_u64(11);
        let now = Utc::now();
        let hits = (0..10_000).filter(|_| s.eval(now, &mut rng) == Eligibility::Executable).count();
        assert!((2_700..=3_300).contains(&hits), "{hits}");
    }

    #[test]
    fn described_action_prefers_flag() {
        let mut flagged = CandidateAction::blueprint("bp");
        flagged.describe_for_llm = true;
        let def = StrategyDefinition::new("s", vec!["t".into()], vec![CandidateAction::action("a"), flagged]);
        assert_eq!(Strategy::new(Arc::new(def)).described_action().unwrap().target.id, "bp");
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let base = StrategyDefinition::new("s", vec!["t".into()], vec![CandidateAction::action("n")]);
        assert!(base.validate().is_ok());

        let mut bad = base.clone();
        bad.possibility = 0;
        assert!(bad.validate().is_err());

        let mut bad = base.clone();
        bad.instance_frequency = -2;
        assert!(bad.validate().is_err());

        let mut bad = base;
        bad.trigger_ids.clear();
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn assignment_resolves_packages_then_direct_ids() {
        let source = Arc::new(StaticCatalogSource::new());
        let strategy = |id: &str| json!({"strategy_id": id, "trigger_ids": ["t"], "actions": [{"target": {"kind": "action", "id": "n"}}]});
        source.set(
            DefinitionKind::Strategy,
            vec![strategy("a"), strategy("b"), strategy("c"), json!({"strategy_id": "broken", "trigger_ids": []})],
        );
        source.set(DefinitionKind::StrategyPackage, vec![json!({"package_id": "p1", "strategy_ids": ["b", "a"]})]);
        source.set(
            DefinitionKind::StrategyAssignment,
            vec![json!({"aid": "ai-1", "strategy_ids": ["a", "c", "ghost"], "package_ids": ["p1", "p_missing"]})],
        );

        let catalog = StrategyCatalog::new(source);
        assert_eq!(catalog.refresh().await.unwrap(), 3);

        let ids = catalog.strategy_ids_for("ai-1");
        assert_eq!(ids, vec!["b", "a", "c", "ghost"]);
        assert_eq!(catalog.materialize(&ids).len(), 3);
        assert!(catalog.strategy_ids_for("ai-unknown").is_empty());
    }
}
