//! Trigger definitions and the registry that serves them.

pub mod scene;
pub mod semantic;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::catalog::{parse_definitions, CatalogSource, DefinitionKind, Refreshable, Snapshot};
use crate::error::{CatalogError, DefinitionError};

pub use semantic::SemanticMatcher;

/// A named condition that can activate strategies. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trigger {
    pub trigger_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Matched by exact event name, then an optional condition script.
    Scene {
        event_name: String,
        #[serde(default)]
        condition_script: Option<serde_json::Value>,
    },
    /// Matched by similarity of an utterance to example phrases (LUI).
    Semantic { corpus: Vec<String> },
}

impl Trigger {
    pub fn scene(id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            trigger_id: id.into(),
            name: String::new(),
            kind: TriggerKind::Scene { event_name: event_name.into(), condition_script: None },
        }
    }

    pub fn semantic(id: impl Into<String>, corpus: Vec<String>) -> Self {
        Self { trigger_id: id.into(), name: String::new(), kind: TriggerKind::Semantic { corpus } }
    }

    pub fn with_condition(mut self, script: serde_json::Value) -> Self {
        if let TriggerKind::Scene { condition_script, .. } = &mut self.kind {
            *condition_script = Some(script);
        }
        self
    }

    pub fn is_scene(&self) -> bool {
        matches!(self.kind, TriggerKind::Scene { .. })
    }

    pub fn is_semantic(&self) -> bool {
        matches!(self.kind, TriggerKind::Semantic { .. })
    }

    /// The exact event name a scene trigger listens for.
    pub fn event_name(&self) -> Option<&str> {
        match &self.kind {
            TriggerKind::Scene { event_name, .. } => Some(event_name),
            TriggerKind::Semantic { .. } => None,
        }
    }

    pub fn corpus(&self) -> &[String] {
        match &self.kind {
            TriggerKind::Semantic { corpus } => corpus,
            TriggerKind::Scene { .. } => &[],
        }
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        if self.trigger_id.trim().is_empty() {
            return Err(DefinitionError::invalid("trigger_id", "must not be empty"));
        }
        match &self.kind {
            TriggerKind::Scene { event_name, .. } if event_name.trim().is_empty() => {
                Err(DefinitionError::invalid("event_name", "must not be empty"))
            }
            TriggerKind::Semantic { corpus } if corpus.iter().all(|p| p.trim().is_empty()) => {
                Err(DefinitionError::invalid("corpus", "needs at least one phrase"))
            }
            _ => Ok(()),
        }
    }
}

type TriggerMap = HashMap<String, Arc<Trigger>>;

/// Live set of trigger definitions, swapped wholesale on refresh.
pub struct TriggerRegistry {
    source: Arc<dyn CatalogSource>,
    snapshot: Snapshot<TriggerMap>,
}

impl TriggerRegistry {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source, snapshot: Snapshot::default() }
    }

    pub fn get_trigger(&self, trigger_id: &str) -> Option<Arc<Trigger>> {
        self.snapshot.load().get(trigger_id).cloned()
    }

    /// Every trigger in the current snapshot.
    pub fn all(&self) -> Vec<Arc<Trigger>> {
        self.snapshot.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Refreshable for TriggerRegistry {
    fn name(&self) -> &'static str {
        "triggers"
    }

    async fn refresh(&self) -> Result<usize, CatalogError> {
        let raw = self.source.load_all(DefinitionKind::Trigger).await?;
        let triggers: Vec<Trigger> = parse_definitions(DefinitionKind::Trigger, raw, Trigger::validate);
        let map: TriggerMap = triggers
            .into_iter()
            .map(|t| (t.trigger_id.clone(), Arc::new(t)))
            .collect();
        let count = map.len();
        self.snapshot.store(map);
        Ok(count)
    }
}
