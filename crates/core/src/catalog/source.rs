use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;

use super::DefinitionKind;
use crate::error::CatalogError;

/// Bulk loader behind every catalog refresh.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Every stored definition of `kind`, as raw JSON documents.
    async fn load_all(&self, kind: DefinitionKind) -> Result<Vec<serde_json::Value>, CatalogError>;
}

/// In-memory source. Built from code in tests, or from a single JSON
/// document of the form `{"trigger": [...], "strategy": [...], ...}`.
#[derive(Debug, Default)]
pub struct StaticCatalogSource {
    items: RwLock<HashMap<DefinitionKind, Vec<serde_json::Value>>>,
}

impl StaticCatalogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every definition of `kind`.
    pub fn set(&self, kind: DefinitionKind, items: Vec<serde_json::Value>) {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, items);
    }

    /// Append one definition.
    pub fn push(&self, kind: DefinitionKind, item: serde_json::Value) {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(item);
    }

    /// Build from a JSON document keyed by kind name. Unknown keys are
    /// logged and ignored.
    pub fn from_document(doc: serde_json::Value) -> Result<Self, CatalogError> {
        let serde_json::Value::Object(map) = doc else {
            return Err(CatalogError::Unavailable("catalog document must be an object".into()));
        };
        let source = Self::new();
        for (key, value) in map {
            let Some(kind) = DefinitionKind::from_name(&key) else {
                tracing::warn!(key = %key, "ignoring unknown definition kind in catalog document");
                continue;
            };
            match value {
                serde_json::Value::Array(items) => source.set(kind, items),
                _ => {
                    tracing::warn!(kind = kind.as_str(), "catalog document entry is not an array");
                }
            }
        }
        Ok(source)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        Self::from_document(doc)
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn load_all(&self, kind: DefinitionKind) -> Result<Vec<serde_json::Value>, CatalogError> {
        Ok(self
            .items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }
}
