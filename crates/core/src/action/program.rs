//! Action Programs: DAGs of atoms scheduled by dependency frontier.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde_json::{Map, Value};

use super::{ActionAtom, AtomStatus};
use crate::error::BuildError;
use crate::schema::{ParamSchema, propagate};

/// `{parent_atom: {child_atom: {output_name: input_name}}}`
pub type AtomGraph = HashMap<String, HashMap<String, HashMap<String, String>>>;

#[derive(Debug, Clone)]
pub struct ActionProgram {
    pub program_id: String,
    pub name: String,
    pub description: String,
    atoms: BTreeMap<String, ActionAtom>,
    graph: AtomGraph,
    /// Atoms not yet handed out, with the parents each one waits on.
    stash: BTreeMap<String, BTreeSet<String>>,
    portals: Vec<String>,
}

impl ActionProgram {
    /// Assemble a program. Every edge endpoint must be one of `atoms`; at
    /// least one atom must have no parents and the graph must be acyclic.
    pub fn new(
        program_id: impl Into<String>,
        atoms: Vec<ActionAtom>,
        graph: AtomGraph,
    ) -> Result<Self, BuildError> {
        let program_id = program_id.into();
        let atoms: BTreeMap<String, ActionAtom> =
            atoms.into_iter().map(|a| (a.atom_id.clone(), a)).collect();

        let mut stash: BTreeMap<String, BTreeSet<String>> =
            atoms.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        for (parent, children) in &graph {
            if !atoms.contains_key(parent) {
                return Err(BuildError::UnknownAtom { program: program_id, atom: parent.clone() });
            }
            for child in children.keys() {
                let Some(parents) = stash.get_mut(child) else {
                    return Err(BuildError::UnknownAtom { program: program_id, atom: child.clone() });
                };
                parents.insert(parent.clone());
            }
        }

        let portals: Vec<String> = stash
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        if portals.is_empty() {
            return Err(BuildError::NoPortal(program_id));
        }
        if has_cycle(&stash, &graph) {
            return Err(BuildError::ProgramCycle(program_id));
        }

        Ok(Self {
            name: program_id.clone(),
            program_id,
            description: String::new(),
            atoms,
            graph,
            stash,
            portals,
        })
    }

    pub fn with_description(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    /// Atoms with no parents, sorted by id.
    pub fn portals(&self) -> &[String] {
        &self.portals
    }

    pub fn atom(&self, atom_id: &str) -> Option<&ActionAtom> {
        self.atoms.get(atom_id)
    }

    /// Atoms whose parents are all done, with their inputs pre-filled from
    /// those parents' results. Each atom is handed out exactly once.
    pub fn ready_to_execute(&mut self) -> Vec<ActionAtom> {
        let ready: Vec<String> = self
            .stash
            .iter()
            .filter(|(_, parents)| {
                parents
                    .iter()
                    .all(|p| self.atoms.get(p).is_some_and(|a| a.status == AtomStatus::Done))
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::with_capacity(ready.len());
        for atom_id in ready {
            let parents = self.stash.remove(&atom_id).unwrap_or_default();
            for parent in &parents {
                self.fill_from_parent(parent, &atom_id);
            }
            if let Some(atom) = self.atoms.get_mut(&atom_id) {
                atom.status = AtomStatus::Running;
                out.push(atom.clone());
            }
        }
        out
    }

    fn fill_from_parent(&mut self, parent: &str, child: &str) {
        let Some(remap) = self.graph.get(parent).and_then(|c| c.get(child)) else {
            return;
        };
        let Some(upstream) = self.atoms.get(parent).map(|a| a.results.clone()) else {
            return;
        };
        if let Some(atom) = self.atoms.get_mut(child) {
            let written = propagate(&upstream, remap, &mut atom.params);
            if !written.is_empty() {
                tracing::debug!(program_id = %self.program_id, parent, child, args = ?written, "prefilled atom inputs");
            }
        }
    }

    /// Record an atom's results and mark it done. Unknown ids are ignored.
    pub fn complete(&mut self, atom_id: &str, outputs: Map<String, Value>) -> bool {
        let Some(atom) = self.atoms.get_mut(atom_id) else {
            return false;
        };
        atom.outputs.set_values(&outputs);
        atom.results = outputs;
        atom.status = AtomStatus::Done;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.stash.is_empty() && self.atoms.values().all(|a| a.status == AtomStatus::Done)
    }

    /// Inputs the program exposes: the union of its portal atoms' inputs.
    pub fn input_schema(&self) -> ParamSchema {
        let mut schema = ParamSchema::new();
        for id in &self.portals {
            if let Some(atom) = self.atoms.get(id) {
                schema.merge(&atom.params);
            }
        }
        schema
    }

    /// Bind values into every portal atom that declares them.
    pub fn set_params(&mut self, values: &Map<String, Value>) -> usize {
        let mut written = 0;
        for id in &self.portals {
            if let Some(atom) = self.atoms.get_mut(id) {
                written += atom.params.set_values(values);
            }
        }
        written
    }

    pub fn apply_preset(&mut self, preset: &Map<String, Value>) {
        for id in &self.portals {
            if let Some(atom) = self.atoms.get_mut(id) {
                atom.params.apply_preset(preset);
            }
        }
    }

    /// Merged results of atoms with no children.
    pub fn results(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (id, atom) in &self.atoms {
            let is_sink = self.graph.get(id).is_none_or(|children| children.is_empty());
            if is_sink {
                out.extend(atom.results.clone());
            }
        }
        out
    }
}

/// Kahn's algorithm over the parent sets.
fn has_cycle(parents: &BTreeMap<String, BTreeSet<String>>, graph: &AtomGraph) -> bool {
    let mut in_degree: HashMap<&str, usize> =
        parents.iter().map(|(id, p)| (id.as_str(), p.len())).collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for child in graph.get(id).into_iter().flat_map(|c| c.keys()) {
            if let Some(d) = in_degree.get_mut(child.as_str()) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(child.as_str());
                }
            }
        }
    }
    visited != parents.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ParamSlot, ParamType};
    use serde_json::json;

    fn atom(id: &str) -> ActionAtom {
        ActionAtom::new(id, "noop").with_params(
            ParamSchema::new()
                .with("location", ParamSlot::new(ParamType::String, "Where"))
                .with("mood", ParamSlot::new(ParamType::String, "How")),
        )
    }

    fn edge(graph: &mut AtomGraph, from: &str, to: &str, remap: &[(&str, &str)]) {
        graph.entry(from.into()).or_default().insert(
            to.into(),
            remap.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect(),
        );
    }

    fn ids(atoms: &[ActionAtom]) -> Vec<&str> {
        atoms.iter().map(|a| a.atom_id.as_str()).collect()
    }

    fn diamond() -> ActionProgram {
        let mut graph = AtomGraph::new();
        edge(&mut graph, "a", "b", &[("city", "location")]);
        edge(&mut graph, "a", "c", &[]);
        edge(&mut graph, "b", "d", &[]);
        edge(&mut graph, "c", "d", &[("feeling", "mood")]);
        ActionProgram::new("p1", ["a", "b", "c", "d"].map(atom).to_vec(), graph).unwrap()
    }

    #[test]
    fn diamond_frontier_order() {
        let mut program = diamond();
        assert_eq!(program.portals(), ["a"]);

        assert_eq!(ids(&program.ready_to_execute()), vec!["a"]);
        assert!(program.ready_to_execute().is_empty());

        program.complete("a", Map::new());
        assert_eq!(ids(&program.ready_to_execute()), vec!["b", "c"]);

        program.complete("b", Map::new());
        assert!(program.ready_to_execute().is_empty());
        program.complete("c", Map::new());
        assert_eq!(ids(&program.ready_to_execute()), vec!["d"]);

        program.complete("d", Map::new());
        assert!(program.ready_to_execute().is_empty());
        assert!(program.is_finished());
    }

    #[test]
    fn parent_results_prefill_children() {
        let mut program = diamond();
        program.ready_to_execute();
        program.complete("a", json!({"city": "Paris"}).as_object().cloned().unwrap());

        let frontier = program.ready_to_execute();
        let b = frontier.iter().find(|a| a.atom_id == "b").unwrap();
        assert_eq!(b.params.get("location"), Some(&json!("Paris")));
        let c = frontier.iter().find(|a| a.atom_id == "c").unwrap();
        assert!(c.params.get("location").is_none());

        program.complete("b", Map::new());
        program.complete("c", json!({"feeling": "calm"}).as_object().cloned().unwrap());
        let d = program.ready_to_execute().remove(0);
        assert_eq!(d.params.get("mood"), Some(&json!("calm")));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut graph = AtomGraph::new();
        edge(&mut graph, "a", "b", &[]);
        edge(&mut graph, "b", "c", &[]);
        edge(&mut graph, "c", "b", &[]);
        let err = ActionProgram::new("p", ["a", "b", "c"].map(atom).to_vec(), graph).unwrap_err();
        assert_eq!(err, BuildError::ProgramCycle("p".into()));
    }

    #[test]
    fn fully_cyclic_program_has_no_portal() {
        let mut graph = AtomGraph::new();
        edge(&mut graph, "a", "b", &[]);
        edge(&mut graph, "b", "a", &[]);
        let err = ActionProgram::new("p", ["a", "b"].map(atom).to_vec(), graph).unwrap_err();
        assert_eq!(err, BuildError::NoPortal("p".into()));
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let mut graph = AtomGraph::new();
        edge(&mut graph, "a", "ghost", &[]);
        let err = ActionProgram::new("p", vec![atom("a")], graph).unwrap_err();
        assert!(matches!(err, BuildError::UnknownAtom { atom, .. } if atom == "ghost"));
    }

    #[test]
    fn params_reach_portals_only() {
        let mut program = diamond();
        program.apply_preset(json!({"mood": "cheerful"}).as_object().unwrap());
        let written = program.set_params(json!({"location": "Oslo", "mood": "grim"}).as_object().unwrap());
        assert_eq!(written, 1);
        assert_eq!(program.atom("a").unwrap().params.get("mood"), Some(&json!("cheerful")));
        assert!(program.atom("b").unwrap().params.get("location").is_none());

        let schema = program.input_schema().to_json_schema();
        assert!(schema["properties"].get("mood").is_none());
    }

    #[test]
    fn results_come_from_sinks() {
        let mut program = diamond();
        program.complete("a", json!({"city": "Paris"}).as_object().cloned().unwrap());
        program.complete("d", json!({"summary": "done"}).as_object().cloned().unwrap());
        let results = program.results();
        assert_eq!(results.get("summary"), Some(&json!("done")));
        assert!(results.get("city").is_none());
    }
}
