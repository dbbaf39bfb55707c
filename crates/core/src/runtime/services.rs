use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionCatalog, ActionQueue};
use crate::blueprint::{BlueprintCatalog, BlueprintRuntime, RouterLimits};
use crate::capability::{
    CompletionClient, ConditionEvaluator, ContextSource, DecisionTableEvaluator, EventMemorySource, LexicalIndex,
    NoContext, SemanticSearch,
};
use crate::catalog::{refresh_logged, spawn_refresh, CatalogSource, Refreshable};
use crate::config::SomaCfg;
use crate::strategy::StrategyCatalog;
use crate::trigger::{SemanticMatcher, TriggerRegistry};

/// Process-wide catalogs and capabilities, shared by every AI instance.
pub struct Services {
    pub cfg: SomaCfg,
    pub triggers: Arc<TriggerRegistry>,
    pub strategies: Arc<StrategyCatalog>,
    pub actions: Arc<ActionCatalog>,
    pub blueprints: Arc<BlueprintCatalog>,
    pub evaluator: Arc<dyn ConditionEvaluator>,
    pub search: Arc<dyn SemanticSearch>,
    pub completion: Option<Arc<dyn CompletionClient>>,
    pub context: Arc<dyn ContextSource>,
}

impl Services {
    /// Catalogs over `source`, with the bundled in-process capabilities and
    /// no completion client.
    pub fn new(cfg: SomaCfg, source: Arc<dyn CatalogSource>) -> Self {
        let triggers = Arc::new(TriggerRegistry::new(source.clone()));
        let actions = Arc::new(ActionCatalog::new(source.clone()));
        Self {
            strategies: Arc::new(StrategyCatalog::new(source.clone())),
            blueprints: Arc::new(BlueprintCatalog::new(source, actions.clone())),
            search: Arc::new(LexicalIndex::new(triggers.clone())),
            triggers,
            actions,
            evaluator: Arc::new(DecisionTableEvaluator),
            completion: None,
            context: Arc::new(NoContext),
            cfg,
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SemanticSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_context(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = context;
        self
    }

    fn catalogs(&self) -> [Arc<dyn Refreshable>; 4] {
        [
            self.triggers.clone(),
            self.actions.clone(),
            self.blueprints.clone(),
            self.strategies.clone(),
        ]
    }

    /// Initial load of every catalog. Returns how many loaded cleanly.
    pub async fn refresh_all(&self) -> usize {
        let mut ok = 0;
        for catalog in self.catalogs() {
            if refresh_logged(&*catalog).await {
                ok += 1;
            }
        }
        ok
    }

    /// One periodic refresh task per catalog.
    pub fn spawn_refreshers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let interval = Duration::from_secs(self.cfg.catalog_refresh_secs.max(1));
        self.catalogs()
            .into_iter()
            .map(|catalog| spawn_refresh(catalog, interval, cancel.clone()))
            .collect()
    }

    pub fn matcher(&self) -> SemanticMatcher {
        SemanticMatcher::new(
            self.search.clone(),
            self.cfg.semantic_workers,
            self.cfg.semantic_top_k,
            self.cfg.semantic_threshold,
        )
    }

    /// What a blueprint activation for one AI instance runs with.
    pub fn blueprint_runtime(&self, queue: ActionQueue, memory: Arc<dyn EventMemorySource>) -> BlueprintRuntime {
        BlueprintRuntime {
            queue,
            evaluator: self.evaluator.clone(),
            completion: self.completion.clone(),
            memory,
            context: self.context.clone(),
            limits: RouterLimits::from(&self.cfg),
        }
    }
}
