//! Error taxonomy for the behavior engine.
//!
//! Only [`BuildError`] is ever fatal, and only for the instance being built.
//! Everything else is recovered locally by the component that observes it.

/// A catalog source could not be read. The previous snapshot stays live.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("catalog json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One malformed definition. Skipped with a warning during refresh.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("malformed definition: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl DefinitionError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// Structural integrity violation detected while constructing a runnable
/// instance. The catalog refuses to produce the instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("action node {0} not found")]
    UnknownAction(String),
    #[error("action atom {atom} referenced by program {program} not found")]
    UnknownAtom { program: String, atom: String },
    #[error("action program {0} not found")]
    UnknownProgram(String),
    #[error("action program {0} has no portal atom")]
    NoPortal(String),
    #[error("action program {0} contains a dependency cycle")]
    ProgramCycle(String),
    #[error("blueprint {0} not found")]
    UnknownBlueprint(String),
    #[error("router {0} not found")]
    UnknownRouter(String),
    #[error("blueprint {blueprint} references missing node {node}")]
    MissingNode { blueprint: String, node: String },
}

/// A router could not pick a destination. Ends the blueprint activation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("llm routing failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("router {router} resolved to unknown node {node}")]
    UnknownNode { router: String, node: String },
    #[error("router {0} requires a destination but none resolved")]
    Unresolved(String),
    #[error("exceeded {0} chained router hops in one turn")]
    HopLimit(usize),
}

/// A condition or router script failed. Treated as "not met" / "no destination".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("script parse error: {0}")]
    Parse(String),
    #[error("script evaluation error: {0}")]
    Runtime(String),
}

/// Semantic search backend failure. Treated as "no match".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    #[error("semantic search unavailable: {0}")]
    Unavailable(String),
}

/// The action consumer dropped its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("action queue closed")]
pub struct QueueClosed;

/// An executor could not run an action atom.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("action atom {atom} failed: {reason}")]
pub struct ExecutionError {
    pub atom: String,
    pub reason: String,
}
