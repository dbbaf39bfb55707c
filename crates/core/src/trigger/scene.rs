use serde_json::{Map, Value};

use super::{Trigger, TriggerKind};
use crate::capability::ConditionEvaluator;
use crate::capability::condition::is_truthy;
use crate::types::Event;

impl Trigger {
    /// Whether this scene trigger fires for `event`.
    ///
    /// The event name must match exactly before any script runs. Script
    /// failures count as "not met".
    pub async fn evaluate_scene(
        &self,
        event: &Event,
        evaluator: &dyn ConditionEvaluator,
        context: &Map<String, Value>,
    ) -> bool {
        let TriggerKind::Scene { event_name, condition_script } = &self.kind else {
            return false;
        };
        let Event::Scene(scene) = event else {
            return false;
        };
        if scene.event_name != *event_name {
            return false;
        }
        let Some(script) = condition_script else {
            return true;
        };

        let mut bindings = context.clone();
        bindings.insert("trigger_event".into(), event.to_binding());
        bindings.insert("hit".into(), Value::Bool(false));

        match evaluator.evaluate(script, bindings).await {
            Ok(out) => out.get("hit").is_some_and(is_truthy),
            Err(e) => {
                tracing::warn!(
                    trigger_id = %self.trigger_id,
                    event_name = %scene.event_name,
                    error = %e,
                    "scene condition failed, treating as not met"
                );
                false
            }
        }
    }
}
