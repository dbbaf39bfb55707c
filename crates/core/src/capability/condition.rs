//! Scene-condition and router-script evaluation.
//!
//! Scripts are never executed as host code. The bundled evaluator reads a
//! JSON decision table:
//!
//! ```json
//! {
//!   "first_match": true,
//!   "rules": [
//!     { "when": [{"path": "trigger_event.payload.level", "op": "gte", "value": 3}],
//!       "set":  {"hit": true, "output_args.city": {"$ref": "trigger_event.payload.city"}} }
//!   ]
//! }
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::EvalError;

/// Runs a script against a binding map and returns the updated map.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        script: &Value,
        bindings: Map<String, Value>,
    ) -> Result<Map<String, Value>, EvalError>;
}

#[derive(Debug, Deserialize)]
struct DecisionTable {
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default = "default_first_match")]
    first_match: bool,
}

fn default_first_match() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Rule {
    #[serde(default)]
    when: Vec<Clause>,
    #[serde(default)]
    set: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Clause {
    path: String,
    op: Op,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
    Exists,
    Missing,
}

/// Bundled [`ConditionEvaluator`] over JSON decision tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecisionTableEvaluator;

impl DecisionTableEvaluator {
    fn parse(script: &Value) -> Result<DecisionTable, EvalError> {
        let parsed = match script {
            Value::String(text) => serde_json::from_str(text),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| EvalError::Parse(e.to_string()))
    }

    fn run(table: &DecisionTable, mut bindings: Map<String, Value>) -> Result<Map<String, Value>, EvalError> {
        for rule in &table.rules {
            if !rule.when.iter().all(|c| clause_holds(c, &bindings)) {
                continue;
            }
            // Resolve references against the pre-rule state so a rule's own
            // writes never feed each other.
            let resolved: Vec<(&String, Value)> = rule
                .set
                .iter()
                .map(|(path, value)| (path, resolve_ref(value, &bindings)))
                .collect();
            for (path, value) in resolved {
                write_path(&mut bindings, path, value)?;
            }
            if table.first_match {
                break;
            }
        }
        Ok(bindings)
    }
}

#[async_trait]
impl ConditionEvaluator for DecisionTableEvaluator {
    async fn evaluate(
        &self,
        script: &Value,
        bindings: Map<String, Value>,
    ) -> Result<Map<String, Value>, EvalError> {
        let table = Self::parse(script)?;
        Self::run(&table, bindings)
    }
}

/// Dotted-path lookup. Numeric segments index arrays.
pub fn lookup<'a>(bindings: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = bindings.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Script-style truthiness of a binding value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn resolve_ref(value: &Value, bindings: &Map<String, Value>) -> Value {
    if let Value::Object(map) = value
        && map.len() == 1
        && let Some(Value::String(path)) = map.get("$ref")
    {
        return lookup(bindings, path).cloned().unwrap_or(Value::Null);
    }
    value.clone()
}

fn write_path(bindings: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), EvalError> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(EvalError::Runtime("empty assignment path".into()));
    };
    let mut current = bindings;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if slot.is_null() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => {
                return Err(EvalError::Runtime(format!(
                    "cannot assign {path}: '{segment}' is not an object"
                )));
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn clause_holds(clause: &Clause, bindings: &Map<String, Value>) -> bool {
    let actual = lookup(bindings, &clause.path);
    match clause.op {
        Op::Exists => actual.is_some_and(|v| !v.is_null()),
        Op::Missing => actual.is_none_or(|v| v.is_null()),
        Op::Eq => actual.is_some_and(|v| loose_eq(v, &clause.value)),
        Op::Ne => !actual.is_some_and(|v| loose_eq(v, &clause.value)),
        Op::Gt => compare(actual, &clause.value).is_some_and(|o| o.is_gt()),
        Op::Gte => compare(actual, &clause.value).is_some_and(|o| o.is_ge()),
        Op::Lt => compare(actual, &clause.value).is_some_and(|o| o.is_lt()),
        Op::Lte => compare(actual, &clause.value).is_some_and(|o| o.is_le()),
        Op::Contains => actual.is_some_and(|v| contains(v, &clause.value)),
        Op::In => actual.is_some_and(|v| contains(&clause.value, v)),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(x), Some(y)) = (actual.as_f64(), expected.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (actual, expected) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|i| loose_eq(i, n)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn first_matching_rule_sets_hit() {
        let script = json!({
            "rules": [
                {"when": [{"path": "trigger_event.payload.level", "op": "gte", "value": 5}],
                 "set": {"hit": "high"}},
                {"when": [{"path": "trigger_event.payload.level", "op": "gte", "value": 3}],
                 "set": {"hit": true}},
                {"set": {"hit": "fallthrough"}}
            ]
        });
        let out = DecisionTableEvaluator
            .evaluate(&script, bindings(json!({"trigger_event": {"payload": {"level": 3}}, "hit": false})))
            .await
            .unwrap();
        assert_eq!(out["hit"], json!(true));
    }

    #[tokio::test]
    async fn all_rules_apply_without_first_match() {
        let script = json!({
            "first_match": false,
            "rules": [
                {"set": {"shared_conditions": "user seems tired"}},
                {"when": [{"path": "user.name", "op": "exists"}], "set": {"output_args.name": {"$ref": "user.name"}}}
            ]
        });
        let out = DecisionTableEvaluator
            .evaluate(&script, bindings(json!({"user": {"name": "Ada"}})))
            .await
            .unwrap();
        assert_eq!(out["shared_conditions"], "user seems tired");
        assert_eq!(out["output_args"]["name"], "Ada");
    }

    #[tokio::test]
    async fn string_scripts_are_parsed() {
        let script = json!(r#"{"rules":[{"when":[{"path":"tags","op":"contains","value":"vip"}],"set":{"hit":true}}]}"#);
        let out = DecisionTableEvaluator
            .evaluate(&script, bindings(json!({"tags": ["new", "vip"]})))
            .await
            .unwrap();
        assert_eq!(out["hit"], json!(true));
    }

    #[tokio::test]
    async fn malformed_script_is_parse_error() {
        let err = DecisionTableEvaluator
            .evaluate(&json!("not json at all"), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Parse(_)));
    }

    #[tokio::test]
    async fn assigning_through_scalar_is_runtime_error() {
        let script = json!({"rules": [{"set": {"hit.deep": true}}]});
        let err = DecisionTableEvaluator
            .evaluate(&script, bindings(json!({"hit": false})))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)));
    }

    #[test]
    fn operators() {
        let b = bindings(json!({"n": 4, "s": "hello", "list": [1, 2], "obj": {"k": null}}));
        let clause = |path: &str, op: Op, value: Value| Clause { path: path.into(), op, value };
        assert!(clause_holds(&clause("n", Op::Eq, json!(4.0)), &b));
        assert!(clause_holds(&clause("n", Op::Ne, json!(5)), &b));
        assert!(clause_holds(&clause("n", Op::Lt, json!(5)), &b));
        assert!(!clause_holds(&clause("s", Op::Gt, json!(1)), &b));
        assert!(clause_holds(&clause("s", Op::Contains, json!("ell")), &b));
        assert!(clause_holds(&clause("n", Op::In, json!([3, 4])), &b));
        assert!(clause_holds(&clause("obj.k", Op::Missing, Value::Null), &b));
        assert!(clause_holds(&clause("list.1", Op::Eq, json!(2)), &b));
        assert!(clause_holds(&clause("nope", Op::Ne, json!(1)), &b));
    }
}
