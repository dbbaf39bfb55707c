use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scene event: something that happened in the AI's environment
/// (user joined, gift received, timer fired). Matched by exact `event_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneEvent {
    pub id: Uuid,
    pub event_name: String,
    /// AI instance the event is addressed to.
    pub aid: String,
    /// Human user involved, if any.
    pub uid: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SceneEvent {
    pub fn new(aid: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_name: event_name.into(),
            aid: aid.into(),
            uid: None,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// One conversational turn from a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub id: Uuid,
    pub aid: String,
    pub uid: Option<String>,
    pub speaker: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEvent {
    pub fn new(aid: impl Into<String>, speaker: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            aid: aid.into(),
            uid: None,
            speaker: speaker.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }
}

/// Any event the engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Scene(SceneEvent),
    Conversation(ConversationEvent),
}

impl Event {
    pub fn id(&self) -> Uuid {
        match self {
            Event::Scene(e) => e.id,
            Event::Conversation(e) => e.id,
        }
    }

    pub fn aid(&self) -> &str {
        match self {
            Event::Scene(e) => &e.aid,
            Event::Conversation(e) => &e.aid,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        match self {
            Event::Scene(e) => e.uid.as_deref(),
            Event::Conversation(e) => e.uid.as_deref(),
        }
    }

    pub fn is_conversation(&self) -> bool {
        matches!(self, Event::Conversation(_))
    }

    /// Natural-language rendering used in router prompts.
    pub fn description(&self) -> String {
        match self {
            Event::Scene(e) => {
                let who = e.uid.as_deref().unwrap_or("someone");
                if e.payload.is_null() {
                    format!("[{}] scene event '{}' from {}", e.timestamp.format("%H:%M:%S"), e.event_name, who)
                } else {
                    format!(
                        "[{}] scene event '{}' from {} with {}",
                        e.timestamp.format("%H:%M:%S"),
                        e.event_name,
                        who,
                        e.payload
                    )
                }
            }
            Event::Conversation(e) => {
                format!("[{}] {} said: {}", e.timestamp.format("%H:%M:%S"), e.speaker, e.message)
            }
        }
    }

    /// JSON form exposed to condition and router scripts as `trigger_event`.
    pub fn to_binding(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<SceneEvent> for Event {
    fn from(e: SceneEvent) -> Self {
        Event::Scene(e)
    }
}

impl From<ConversationEvent> for Event {
    fn from(e: ConversationEvent) -> Self {
        Event::Conversation(e)
    }
}
