//! Capabilities the engine consumes but does not own: script evaluation,
//! text completion, nearest-neighbour search and event memory. Each is a
//! trait object injected at the composition root, with a bundled
//! in-process implementation.

pub mod completion;
pub mod condition;
pub mod memory;
pub mod search;

pub use completion::{CompletionClient, FunctionCall, LlmCompletion};
pub use condition::{ConditionEvaluator, DecisionTableEvaluator};
pub use memory::{ContextSource, EventLog, EventMemorySource, NoContext};
pub use search::{LexicalIndex, SemanticSearch};
