//! Action nodes (atomic or program), their definitions and the catalog that
//! turns definitions into runnable, parameter-bindable instances.

pub mod program;
pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::catalog::{parse_definitions, CatalogSource, DefinitionKind, Refreshable, Snapshot};
use crate::error::{BuildError, CatalogError, DefinitionError};
use crate::schema::{function_name, FunctionDescription, ParamSchema};

pub use program::{ActionProgram, AtomGraph};
pub use queue::{ActionExecutor, ActionQueue, ActionReport, Origin, QueuedAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtomStatus {
    #[default]
    Pending,
    Running,
    Done,
}

/// One executable step. `action_type` names the executor template.
#[derive(Debug, Clone)]
pub struct ActionAtom {
    pub atom_id: String,
    pub name: String,
    pub description: String,
    pub action_type: String,
    pub params: ParamSchema,
    pub outputs: ParamSchema,
    /// Raw values reported by the executor.
    pub results: Map<String, Value>,
    pub status: AtomStatus,
}

impl ActionAtom {
    pub fn new(atom_id: impl Into<String>, action_type: impl Into<String>) -> Self {
        let atom_id = atom_id.into();
        Self {
            name: atom_id.clone(),
            atom_id,
            description: String::new(),
            action_type: action_type.into(),
            params: ParamSchema::new(),
            outputs: ParamSchema::new(),
            results: Map::new(),
            status: AtomStatus::Pending,
        }
    }

    pub fn with_params(mut self, params: ParamSchema) -> Self {
        self.params = params;
        self
    }

    pub fn with_outputs(mut self, outputs: ParamSchema) -> Self {
        self.outputs = outputs;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ActionBody {
    Atomic(ActionAtom),
    Program(ActionProgram),
}

/// A resolved, bindable action. Fresh per activation.
#[derive(Debug, Clone)]
pub struct ActionNode {
    pub node_id: String,
    pub name: String,
    pub description: String,
    /// Seconds the executor may hold the action before dropping it.
    pub queuing_time: Option<f64>,
    /// Extra instruction for the executor's own prompt, if it uses one.
    pub system_hint: Option<String>,
    pub body: ActionBody,
}

impl ActionNode {
    pub fn atomic(node_id: impl Into<String>, atom: ActionAtom) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            description: String::new(),
            queuing_time: None,
            system_hint: None,
            body: ActionBody::Atomic(atom),
        }
    }

    pub fn program(node_id: impl Into<String>, program: ActionProgram) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            description: String::new(),
            queuing_time: None,
            system_hint: None,
            body: ActionBody::Program(program),
        }
    }

    pub fn with_description(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    pub fn is_program(&self) -> bool {
        matches!(self.body, ActionBody::Program(_))
    }

    /// Input slots (for programs, the union of portal atom inputs).
    pub fn params(&self) -> ParamSchema {
        match &self.body {
            ActionBody::Atomic(atom) => atom.params.clone(),
            ActionBody::Program(program) => program.input_schema(),
        }
    }

    pub fn set_params(&mut self, values: &Map<String, Value>) -> usize {
        match &mut self.body {
            ActionBody::Atomic(atom) => atom.params.set_values(values),
            ActionBody::Program(program) => program.set_params(values),
        }
    }

    pub fn apply_preset(&mut self, preset: &Map<String, Value>) {
        match &mut self.body {
            ActionBody::Atomic(atom) => atom.params.apply_preset(preset),
            ActionBody::Program(program) => program.apply_preset(preset),
        }
    }

    pub fn function_description(&self) -> FunctionDescription {
        FunctionDescription::new(function_name(&self.name), self.description.clone(), self.params())
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AtomDefinition {
    pub atom_id: String,
    #[serde(default)]
    pub atom_name: String,
    #[serde(default)]
    pub description: String,
    pub action_type: String,
    #[serde(default)]
    pub params: ParamSchema,
    #[serde(default)]
    pub outputs: ParamSchema,
    #[serde(default)]
    pub preset: Map<String, Value>,
}

impl AtomDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.atom_id.trim().is_empty() {
            return Err(DefinitionError::invalid("atom_id", "must not be empty"));
        }
        if self.action_type.trim().is_empty() {
            return Err(DefinitionError::invalid("action_type", "must not be empty"));
        }
        Ok(())
    }

    fn build(&self) -> ActionAtom {
        let mut atom = ActionAtom::new(&self.atom_id, &self.action_type)
            .with_params(self.params.clone())
            .with_outputs(self.outputs.clone());
        if !self.atom_name.is_empty() {
            atom.name = self.atom_name.clone();
        }
        atom.description = self.description.clone();
        atom.params.apply_preset(&self.preset);
        atom
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramDefinition {
    pub program_id: String,
    #[serde(default)]
    pub program_name: String,
    #[serde(default)]
    pub description: String,
    pub atoms: Vec<String>,
    #[serde(default)]
    pub connections: AtomGraph,
}

impl ProgramDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.program_id.trim().is_empty() {
            return Err(DefinitionError::invalid("program_id", "must not be empty"));
        }
        if self.atoms.is_empty() {
            return Err(DefinitionError::invalid("atoms", "a program needs at least one atom"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Atomic,
    Program,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeDefinition {
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub description: String,
    pub action_type: ActionKind,
    pub action_id: String,
    #[serde(default)]
    pub preset: Map<String, Value>,
    #[serde(default)]
    pub queuing_time: Option<f64>,
    #[serde(default)]
    pub system_hint: Option<String>,
}

impl NodeDefinition {
    fn validate(&self) -> Result<(), DefinitionError> {
        if self.node_id.trim().is_empty() {
            return Err(DefinitionError::invalid("node_id", "must not be empty"));
        }
        if self.action_id.trim().is_empty() {
            return Err(DefinitionError::invalid("action_id", "must not be empty"));
        }
        if self.queuing_time.is_some_and(|t| t < 0.0) {
            return Err(DefinitionError::invalid("queuing_time", "must not be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ActionDefinitions {
    atoms: HashMap<String, AtomDefinition>,
    programs: HashMap<String, ProgramDefinition>,
    nodes: HashMap<String, NodeDefinition>,
}

/// Live action definitions. [`resolve`](Self::resolve) builds fresh instances.
pub struct ActionCatalog {
    source: Arc<dyn CatalogSource>,
    snapshot: Snapshot<ActionDefinitions>,
}

impl ActionCatalog {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source, snapshot: Snapshot::default() }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.snapshot.load().nodes.contains_key(node_id)
    }

    /// Build a fresh node instance with presets applied.
    pub fn resolve(&self, node_id: &str) -> Result<ActionNode, BuildError> {
        let defs = self.snapshot.load();
        let def = defs
            .nodes
            .get(node_id)
            .ok_or_else(|| BuildError::UnknownAction(node_id.to_string()))?;

        let mut node = match def.action_type {
            ActionKind::Atomic => {
                let atom = defs.atoms.get(&def.action_id).ok_or_else(|| BuildError::UnknownAtom {
                    program: def.node_id.clone(),
                    atom: def.action_id.clone(),
                })?;
                ActionNode::atomic(&def.node_id, atom.build())
            }
            ActionKind::Program => ActionNode::program(&def.node_id, build_program(&defs, &def.action_id)?),
        };
        if !def.node_name.is_empty() {
            node.name = def.node_name.clone();
        }
        node.description = def.description.clone();
        node.queuing_time = def.queuing_time;
        node.system_hint = def.system_hint.clone();
        node.apply_preset(&def.preset);
        Ok(node)
    }

    /// Build a standalone program instance.
    pub fn resolve_program(&self, program_id: &str) -> Result<ActionProgram, BuildError> {
        build_program(&self.snapshot.load(), program_id)
    }
}

fn build_program(defs: &ActionDefinitions, program_id: &str) -> Result<ActionProgram, BuildError> {
    let def = defs
        .programs
        .get(program_id)
        .ok_or_else(|| BuildError::UnknownProgram(program_id.to_string()))?;
    let atoms = def
        .atoms
        .iter()
        .map(|id| {
            defs.atoms.get(id).map(AtomDefinition::build).ok_or_else(|| BuildError::UnknownAtom {
                program: def.program_id.clone(),
                atom: id.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let name = if def.program_name.is_empty() { &def.program_id } else { &def.program_name };
    Ok(ActionProgram::new(&def.program_id, atoms, def.connections.clone())?
        .with_description(name, &def.description))
}

#[async_trait]
impl Refreshable for ActionCatalog {
    fn name(&self) -> &'static str {
        "actions"
    }

    async fn refresh(&self) -> Result<usize, CatalogError> {
        let atoms_raw = self.source.load_all(DefinitionKind::ActionAtom).await?;
        let programs_raw = self.source.load_all(DefinitionKind::ActionProgram).await?;
        let nodes_raw = self.source.load_all(DefinitionKind::ActionNode).await?;

        let defs = ActionDefinitions {
            atoms: parse_definitions(DefinitionKind::ActionAtom, atoms_raw, AtomDefinition::validate)
                .into_iter()
                .map(|d: AtomDefinition| (d.atom_id.clone(), d))
                .collect(),
            programs: parse_definitions(DefinitionKind::ActionProgram, programs_raw, ProgramDefinition::validate)
                .into_iter()
                .map(|d: ProgramDefinition| (d.program_id.clone(), d))
                .collect(),
            nodes: parse_definitions(DefinitionKind::ActionNode, nodes_raw, NodeDefinition::validate)
                .into_iter()
                .map(|d: NodeDefinition| (d.node_id.clone(), d))
                .collect(),
        };
        let count = defs.atoms.len() + defs.programs.len() + defs.nodes.len();
        self.snapshot.store(defs);
        Ok(count)
    }
}
