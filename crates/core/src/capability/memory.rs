use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::types::Event;

/// Recent events for one AI instance, oldest first.
#[async_trait]
pub trait EventMemorySource: Send + Sync {
    async fn recent_events(&self, count: usize) -> Vec<Event>;
}

/// Contextual lookups (user profile, AI profile, what the AI remembers about
/// the user) merged into script bindings. Keys become top-level bindings.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn lookup(&self, aid: &str, uid: Option<&str>) -> Map<String, Value>;
}

/// A [`ContextSource`] with nothing to say.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait]
impl ContextSource for NoContext {
    async fn lookup(&self, _aid: &str, _uid: Option<&str>) -> Map<String, Value> {
        Map::new()
    }
}

/// Bounded in-process event history.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, events: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn record(&self, event: Event) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventMemorySource for EventLog {
    async fn recent_events(&self, count: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let skip = events.len().saturating_sub(count);
        events.iter().skip(skip).cloned().collect()
    }
}
