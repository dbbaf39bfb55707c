//! Named, typed parameter slots shared by action atoms, action nodes and
//! routers, and their rendering as LLM-callable function descriptions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use soma_llm::provider::ToolDefinition;

/// JSON type of a parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }
}

/// One named slot. Holds at most one bound value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamSlot {
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Bound by a preset; immutable for the rest of the instance's life.
    #[serde(skip)]
    locked: bool,
}

impl ParamSlot {
    pub fn new(kind: ParamType, description: impl Into<String>) -> Self {
        Self { kind, description: description.into(), ..Default::default() }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

/// Ordered set of named parameter slots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    slots: BTreeMap<String, ParamSlot>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, slot: ParamSlot) -> Self {
        self.slots.insert(name.into(), slot);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, name: &str) -> Option<&ParamSlot> {
        self.slots.get(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots.get(name).and_then(|s| s.value.as_ref())
    }

    /// Bind values into matching, unlocked slots. Unknown names are ignored.
    /// Returns the number of slots written.
    pub fn set_values(&mut self, values: &Map<String, Value>) -> usize {
        let mut written = 0;
        for (name, value) in values {
            if let Some(slot) = self.slots.get_mut(name)
                && !slot.locked
            {
                slot.value = Some(value.clone());
                written += 1;
            }
        }
        written
    }

    /// Bind preset values and lock those slots.
    pub fn apply_preset(&mut self, preset: &Map<String, Value>) {
        for (name, value) in preset {
            if let Some(slot) = self.slots.get_mut(name) {
                slot.value = Some(value.clone());
                slot.locked = true;
            }
        }
    }

    /// All currently bound values.
    pub fn values(&self) -> Map<String, Value> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    pub fn missing_required(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|(_, s)| s.required && s.value.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.missing_required().is_empty()
    }

    /// Union of slots; existing names keep their first definition.
    pub fn merge(&mut self, other: &ParamSchema) {
        for (name, slot) in &other.slots {
            self.slots.entry(name.clone()).or_insert_with(|| slot.clone());
        }
    }

    /// JSON Schema for the slots a model may still fill (locked slots excluded).
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, slot) in self.slots.iter().filter(|(_, s)| !s.locked) {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(slot.kind.as_str().into()));
            prop.insert("description".into(), Value::String(slot.description.clone()));
            if let Some(values) = &slot.enum_values {
                prop.insert("enum".into(), serde_json::json!(values));
            }
            properties.insert(name.clone(), Value::Object(prop));
            if slot.required {
                required.push(Value::String(name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Rename upstream values through an `{upstream_output_name: downstream_input_name}`
/// remap. Absent and null upstream values are skipped.
pub fn remap_values(upstream: &Map<String, Value>, remap: &HashMap<String, String>) -> Map<String, Value> {
    remap
        .iter()
        .filter_map(|(source, target)| {
            upstream
                .get(source)
                .filter(|v| !v.is_null())
                .map(|v| (target.clone(), v.clone()))
        })
        .collect()
}

/// Copy upstream values into downstream inputs through a remap.
/// Returns the values that were written.
pub fn propagate(
    upstream: &Map<String, Value>,
    remap: &HashMap<String, String>,
    downstream: &mut ParamSchema,
) -> Map<String, Value> {
    let mapped = remap_values(upstream, remap);
    downstream.set_values(&mapped);
    mapped
}

/// An externally visible, LLM-callable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescription {
    pub name: String,
    pub description: String,
    pub parameters: ParamSchema,
}

impl FunctionDescription {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: ParamSchema) -> Self {
        Self { name: name.into(), description: description.into(), parameters }
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn to_tool(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters.to_json_schema(),
        }
    }
}

/// Reduce a display name to a function-name-safe identifier.
pub fn function_name(raw: &str) -> String {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() { "unnamed".to_string() } else { name }
}

/// Shallow check of model-supplied arguments against a function's JSON Schema:
/// object shape, required keys present, primitive property types.
pub fn validate_arguments(input: &Value, schema: &Value) -> Result<(), String> {
    if !input.is_object() {
        return Err(format!("arguments are not an object: {}", preview(&input.to_string(), 120)));
    }

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if input.get(key).is_none() {
                return Err(format!("required argument '{key}' missing"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|v| v.as_object()) {
        for (key, prop_schema) in props {
            if let Some(value) = input.get(key)
                && let Some(type_name) = prop_schema.get("type").and_then(|v| v.as_str())
                && !matches_json_type(value, type_name)
            {
                return Err(format!("argument '{key}' is not of type {type_name}"));
            }
        }
    }

    Ok(())
}

fn matches_json_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

pub(crate) fn preview(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push_str("...");
    }
    out
}
