//! Blueprints: possibly-cyclic graphs of router and action nodes, walked one
//! event at a time by a [`BlueprintInstance`].

pub mod instance;
pub mod router;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::action::{ActionCatalog, ActionNode, ActionQueue};
use crate::capability::{CompletionClient, ConditionEvaluator, ContextSource, EventMemorySource};
use crate::catalog::{parse_definitions, CatalogSource, DefinitionKind, Refreshable, Snapshot};
use crate::config::SomaCfg;
use crate::error::{BuildError, CatalogError, DefinitionError};
use crate::schema::{function_name, FunctionDescription, ParamSchema};

pub use instance::{Advance, BlueprintInstance, StepResult};

/// `{child_node_id: {output_name: input_name}}`, children in id order.
pub type Children = BTreeMap<String, HashMap<String, String>>;

#[derive(Debug, Clone, Deserialize)]
pub struct RouterDefinition {
    pub router_id: String,
    #[serde(default)]
    pub router_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub script_router: Option<Value>,
    #[serde(default = "default_llm_routing")]
    pub llm_routing: bool,
    #[serde(default)]
    pub params: ParamSchema,
}

fn default_llm_routing() -> bool {
    true
}

impl RouterDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.router_id.trim().is_empty() {
            return Err(DefinitionError::invalid("router_id", "must not be empty"));
        }
        let has_script = self.script_router.as_ref().is_some_and(|s| !is_blank(s));
        if !has_script && !self.llm_routing {
            return Err(DefinitionError::invalid("script_router", "a router without llm routing needs a script"));
        }
        Ok(())
    }
}

fn is_blank(script: &Value) -> bool {
    match script {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlueprintDefinition {
    pub bp_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub portal_node: String,
    #[serde(default)]
    pub action_nodes: Vec<String>,
    #[serde(default)]
    pub router_nodes: Vec<String>,
    #[serde(default)]
    pub connections: HashMap<String, Children>,
    /// Blueprint-local display names, used as LLM function names.
    #[serde(default)]
    pub node_names: HashMap<String, String>,
}

impl BlueprintDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.bp_id.trim().is_empty() {
            return Err(DefinitionError::invalid("bp_id", "must not be empty"));
        }
        if self.portal_node.trim().is_empty() {
            return Err(DefinitionError::invalid("portal_node", "must not be empty"));
        }
        Ok(())
    }
}

/// A router as placed in one blueprint activation.
#[derive(Debug, Clone)]
pub struct RouterNode {
    pub router_id: String,
    pub name: String,
    pub description: String,
    pub script: Option<Value>,
    pub llm_routing: bool,
    /// Inputs filled from the preceding action's outputs.
    pub params: ParamSchema,
}

impl RouterNode {
    pub fn new(router_id: impl Into<String>) -> Self {
        let router_id = router_id.into();
        Self {
            name: router_id.clone(),
            router_id,
            description: String::new(),
            script: None,
            llm_routing: true,
            params: ParamSchema::new(),
        }
    }

    pub fn with_script(mut self, script: Value) -> Self {
        self.script = Some(script);
        self
    }

    pub fn script_only(mut self) -> Self {
        self.llm_routing = false;
        self
    }

    pub fn has_script(&self) -> bool {
        self.script.as_ref().is_some_and(|s| !is_blank(s))
    }

    pub fn function_description(&self) -> FunctionDescription {
        FunctionDescription::new(function_name(&self.name), self.description.clone(), self.params.clone())
    }

    fn from_definition(def: &RouterDefinition) -> Self {
        Self {
            router_id: def.router_id.clone(),
            name: if def.router_name.is_empty() { def.router_id.clone() } else { def.router_name.clone() },
            description: def.description.clone(),
            script: def.script_router.clone().filter(|s| !is_blank(s)),
            llm_routing: def.llm_routing,
            params: def.params.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BlueprintNode {
    Router(RouterNode),
    Action(ActionNode),
}

impl BlueprintNode {
    pub fn id(&self) -> &str {
        match self {
            BlueprintNode::Router(r) => &r.router_id,
            BlueprintNode::Action(a) => &a.node_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BlueprintNode::Router(r) => &r.name,
            BlueprintNode::Action(a) => &a.name,
        }
    }

    pub fn is_router(&self) -> bool {
        matches!(self, BlueprintNode::Router(_))
    }

    pub fn set_params(&mut self, values: &serde_json::Map<String, Value>) -> usize {
        match self {
            BlueprintNode::Router(r) => r.params.set_values(values),
            BlueprintNode::Action(a) => a.set_params(values),
        }
    }

    pub fn params(&self) -> ParamSchema {
        match self {
            BlueprintNode::Router(r) => r.params.clone(),
            BlueprintNode::Action(a) => a.params(),
        }
    }

    pub fn function_description(&self) -> FunctionDescription {
        match self {
            BlueprintNode::Router(r) => r.function_description(),
            BlueprintNode::Action(a) => a.function_description(),
        }
    }
}

/// Arena storage: nodes keyed by id, edges as adjacency maps keyed by id.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub bp_id: String,
    pub name: String,
    pub description: String,
    pub portal: String,
    nodes: HashMap<String, BlueprintNode>,
    edges: HashMap<String, Children>,
    local_names: HashMap<String, String>,
}

impl Blueprint {
    /// Assemble and check a graph. Dangling references are hard errors;
    /// shape rules (action fan-out, router dead ends) only warn.
    pub fn new(
        bp_id: impl Into<String>,
        portal: impl Into<String>,
        nodes: Vec<BlueprintNode>,
        edges: HashMap<String, Children>,
    ) -> Result<Self, BuildError> {
        let bp_id = bp_id.into();
        let portal = portal.into();
        let nodes: HashMap<String, BlueprintNode> =
            nodes.into_iter().map(|n| (n.id().to_string(), n)).collect();

        let missing = |node: &str| BuildError::MissingNode { blueprint: bp_id.clone(), node: node.to_string() };
        if !nodes.contains_key(&portal) {
            return Err(missing(&portal));
        }
        for (from, children) in &edges {
            if !nodes.contains_key(from) {
                return Err(missing(from));
            }
            if let Some(child) = children.keys().find(|c| !nodes.contains_key(*c)) {
                return Err(missing(child));
            }
        }

        let blueprint = Self {
            name: bp_id.clone(),
            bp_id,
            description: String::new(),
            portal,
            nodes,
            edges,
            local_names: HashMap::new(),
        };
        blueprint.warn_on_shape();
        Ok(blueprint)
    }

    pub fn with_description(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    pub fn with_local_names(mut self, names: HashMap<String, String>) -> Self {
        self.local_names = names;
        self
    }

    fn warn_on_shape(&self) {
        for (id, node) in &self.nodes {
            let children = self.children(id);
            match node {
                BlueprintNode::Action(_) => {
                    if children.len() > 1 {
                        tracing::warn!(bp_id = %self.bp_id, node_id = %id, "action node has more than one outgoing edge");
                    }
                    if children.iter().any(|c| !self.node(c).is_some_and(BlueprintNode::is_router)) {
                        tracing::warn!(bp_id = %self.bp_id, node_id = %id, "action node edge does not target a router");
                    }
                }
                BlueprintNode::Router(_) if children.is_empty() => {
                    tracing::warn!(bp_id = %self.bp_id, node_id = %id, "router node has no outgoing edge");
                }
                BlueprintNode::Router(_) => {}
            }
        }
    }

    pub fn node(&self, id: &str) -> Option<&BlueprintNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut BlueprintNode> {
        self.nodes.get_mut(id)
    }

    pub fn children(&self, id: &str) -> Vec<&str> {
        self.edges
            .get(id)
            .map(|c| c.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn remap(&self, from: &str, to: &str) -> Option<&HashMap<String, String>> {
        self.edges.get(from).and_then(|c| c.get(to))
    }

    /// The router an action hands control to, if its single edge targets one.
    pub fn next_router(&self, action_id: &str) -> Option<&str> {
        let children = self.children(action_id);
        match children.as_slice() {
            [only] if self.node(only).is_some_and(BlueprintNode::is_router) => Some(*only),
            _ => None,
        }
    }

    /// Blueprint-local name of a node, falling back to the node's own name.
    pub fn local_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.local_names
            .get(id)
            .map(String::as_str)
            .or_else(|| self.node(id).map(BlueprintNode::name))
            .unwrap_or(id)
    }

    /// The whole blueprint as one callable function: its name and mission,
    /// with the portal's inputs.
    pub fn function_description(&self) -> FunctionDescription {
        let params = self.node(&self.portal).map(BlueprintNode::params).unwrap_or_default();
        FunctionDescription::new(function_name(&self.name), self.description.clone(), params)
    }

    /// Children of `router_id` as callable functions, keyed by the unique
    /// function name each was exposed under.
    pub fn child_functions(&self, router_id: &str) -> Vec<(String, FunctionDescription)> {
        let mut used = HashSet::new();
        let mut out = Vec::new();
        for child in self.children(router_id) {
            let Some(node) = self.node(child) else { continue };
            let base = function_name(self.local_name(child));
            let mut name = base.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{base}_{n}");
                n += 1;
            }
            out.push((child.to_string(), node.function_description().renamed(name)));
        }
        out
    }
}

/// Limits a walker runs under.
#[derive(Debug, Clone, Copy)]
pub struct RouterLimits {
    pub self_cancel_limit: u32,
    pub max_attempts: u32,
    pub event_window: usize,
    pub max_hops: usize,
}

impl From<&SomaCfg> for RouterLimits {
    fn from(cfg: &SomaCfg) -> Self {
        Self {
            self_cancel_limit: cfg.self_cancel_limit,
            max_attempts: cfg.router_max_attempts.max(1),
            event_window: cfg.router_event_window,
            max_hops: cfg.router_max_hops.max(1),
        }
    }
}

impl Default for RouterLimits {
    fn default() -> Self {
        (&SomaCfg::default()).into()
    }
}

/// Capabilities a blueprint activation needs. Cheap to clone.
#[derive(Clone)]
pub struct BlueprintRuntime {
    pub queue: ActionQueue,
    pub evaluator: Arc<dyn ConditionEvaluator>,
    pub completion: Option<Arc<dyn CompletionClient>>,
    pub memory: Arc<dyn EventMemorySource>,
    pub context: Arc<dyn ContextSource>,
    pub limits: RouterLimits,
}

#[derive(Debug, Default)]
struct BlueprintDefinitions {
    routers: HashMap<String, RouterDefinition>,
    blueprints: HashMap<String, BlueprintDefinition>,
}

/// Live blueprint and router definitions.
pub struct BlueprintCatalog {
    source: Arc<dyn CatalogSource>,
    actions: Arc<ActionCatalog>,
    snapshot: Snapshot<BlueprintDefinitions>,
}

impl BlueprintCatalog {
    pub fn new(source: Arc<dyn CatalogSource>, actions: Arc<ActionCatalog>) -> Self {
        Self { source, actions, snapshot: Snapshot::default() }
    }

    pub fn contains(&self, bp_id: &str) -> bool {
        self.snapshot.load().blueprints.contains_key(bp_id)
    }

    /// Build the graph with fresh node instances.
    pub fn build(&self, bp_id: &str) -> Result<Blueprint, BuildError> {
        let defs = self.snapshot.load();
        let def = defs
            .blueprints
            .get(bp_id)
            .ok_or_else(|| BuildError::UnknownBlueprint(bp_id.to_string()))?;

        let mut nodes = Vec::with_capacity(def.action_nodes.len() + def.router_nodes.len());
        for node_id in &def.action_nodes {
            let node = self.actions.resolve(node_id).map_err(|e| match e {
                BuildError::UnknownAction(node) => BuildError::MissingNode { blueprint: def.bp_id.clone(), node },
                other => other,
            })?;
            nodes.push(BlueprintNode::Action(node));
        }
        for router_id in &def.router_nodes {
            let router = defs.routers.get(router_id).ok_or_else(|| BuildError::MissingNode {
                blueprint: def.bp_id.clone(),
                node: router_id.clone(),
            })?;
            nodes.push(BlueprintNode::Router(RouterNode::from_definition(router)));
        }

        let name = if def.name.is_empty() { &def.bp_id } else { &def.name };
        Ok(Blueprint::new(&def.bp_id, &def.portal_node, nodes, def.connections.clone())?
            .with_description(name, &def.description)
            .with_local_names(def.node_names.clone()))
    }

    /// A fresh, traversal-ready activation of `bp_id`.
    pub fn instantiate(&self, bp_id: &str, runtime: BlueprintRuntime) -> Result<BlueprintInstance, BuildError> {
        Ok(BlueprintInstance::new(self.build(bp_id)?, runtime))
    }
}

#[async_trait]
impl Refreshable for BlueprintCatalog {
    fn name(&self) -> &'static str {
        "blueprints"
    }

    async fn refresh(&self) -> Result<usize, CatalogError> {
        let routers_raw = self.source.load_all(DefinitionKind::Router).await?;
        let blueprints_raw = self.source.load_all(DefinitionKind::Blueprint).await?;
        let defs = BlueprintDefinitions {
            routers: parse_definitions(DefinitionKind::Router, routers_raw, RouterDefinition::validate)
                .into_iter()
                .map(|d: RouterDefinition| (d.router_id.clone(), d))
                .collect(),
            blueprints: parse_definitions(DefinitionKind::Blueprint, blueprints_raw, BlueprintDefinition::validate)
                .into_iter()
                .map(|d: BlueprintDefinition| (d.bp_id.clone(), d))
                .collect(),
        };
        let count = defs.routers.len() + defs.blueprints.len();
        self.snapshot.store(defs);
        Ok(count)
    }
}
