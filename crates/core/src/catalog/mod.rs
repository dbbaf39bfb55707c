//! Definition catalogs: atomically swapped snapshots refreshed from a
//! [`CatalogSource`] on fixed-interval timers.

pub mod db;
pub mod source;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{CatalogError, DefinitionError};
pub use source::{CatalogSource, StaticCatalogSource};

/// Kind of persisted definition. Each kind is loaded wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    Trigger,
    Strategy,
    StrategyPackage,
    StrategyAssignment,
    ActionAtom,
    ActionProgram,
    ActionNode,
    Router,
    Blueprint,
}

impl DefinitionKind {
    pub const ALL: [DefinitionKind; 9] = [
        DefinitionKind::Trigger,
        DefinitionKind::Strategy,
        DefinitionKind::StrategyPackage,
        DefinitionKind::StrategyAssignment,
        DefinitionKind::ActionAtom,
        DefinitionKind::ActionProgram,
        DefinitionKind::ActionNode,
        DefinitionKind::Router,
        DefinitionKind::Blueprint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DefinitionKind::Trigger => "trigger",
            DefinitionKind::Strategy => "strategy",
            DefinitionKind::StrategyPackage => "strategy_package",
            DefinitionKind::StrategyAssignment => "strategy_assignment",
            DefinitionKind::ActionAtom => "action_atom",
            DefinitionKind::ActionProgram => "action_program",
            DefinitionKind::ActionNode => "action_node",
            DefinitionKind::Router => "router",
            DefinitionKind::Blueprint => "blueprint",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Body field holding a definition's id.
    pub fn id_field(self) -> &'static str {
        match self {
            DefinitionKind::Trigger => "trigger_id",
            DefinitionKind::Strategy => "strategy_id",
            DefinitionKind::StrategyPackage => "package_id",
            DefinitionKind::StrategyAssignment => "aid",
            DefinitionKind::ActionAtom => "atom_id",
            DefinitionKind::ActionProgram => "program_id",
            DefinitionKind::ActionNode => "node_id",
            DefinitionKind::Router => "router_id",
            DefinitionKind::Blueprint => "bp_id",
        }
    }

    /// Id of a raw definition of this kind, if it has one.
    pub fn definition_id(self, item: &serde_json::Value) -> Option<&str> {
        item.get(self.id_field()).and_then(|v| v.as_str())
    }
}

/// Read-mostly snapshot. Readers clone the inner `Arc` and never observe a
/// half-applied refresh.
#[derive(Debug, Default)]
pub struct Snapshot<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(Arc::new(value)) }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(value);
    }
}

/// A catalog that can reload itself from its source.
#[async_trait]
pub trait Refreshable: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reload and swap in a new snapshot. Returns the number of definitions loaded.
    /// On error the previous snapshot must remain in place.
    async fn refresh(&self) -> Result<usize, CatalogError>;
}

/// Refresh once, logging instead of failing.
pub async fn refresh_logged(catalog: &dyn Refreshable) -> bool {
    match catalog.refresh().await {
        Ok(count) => {
            tracing::debug!(catalog = catalog.name(), count, "catalog refreshed");
            true
        }
        Err(e) => {
            tracing::warn!(
                catalog = catalog.name(),
                error = %e,
                "catalog refresh failed, keeping previous snapshot"
            );
            false
        }
    }
}

/// Spawn the periodic refresh task for one catalog.
pub fn spawn_refresh(
    catalog: Arc<dyn Refreshable>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(catalog = catalog.name(), "catalog refresh task shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            refresh_logged(&*catalog).await;
        }
    })
}

/// Deserialize every item of one kind, skipping (and logging) the malformed ones.
/// `validate` runs after deserialization; its errors also skip the item.
pub(crate) fn parse_definitions<T, F>(
    kind: DefinitionKind,
    raw: Vec<serde_json::Value>,
    mut validate: F,
) -> Vec<T>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> Result<(), DefinitionError>,
{
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        let id = kind.definition_id(&item).unwrap_or("<unknown>").to_string();
        let parsed = serde_json::from_value::<T>(item)
            .map_err(DefinitionError::from)
            .and_then(|def| validate(&def).map(|_| def));
        match parsed {
            Ok(def) => out.push(def),
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), id = %id, error = %e, "skipping definition");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(serde::Deserialize)]
    struct Item {
        id: u32,
    }

    #[test]
    fn parse_skips_malformed_and_invalid() {
        let raw = vec![
            serde_json::json!({"id": 1}),
            serde_json::json!({"id": "nope"}),
            serde_json::json!({"id": 3}),
        ];
        let items: Vec<Item> = parse_definitions(DefinitionKind::Trigger, raw, |i: &Item| {
            if i.id == 3 {
                Err(DefinitionError::invalid("id", "three is reserved"))
            } else {
                Ok(())
            }
        });
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 1);
    }

    #[test]
    fn snapshot_swaps_wholesale() {
        let snap = Snapshot::new(vec![1, 2]);
        let old = snap.load();
        snap.store(vec![3]);
        assert_eq!(*old, vec![1, 2]);
        assert_eq!(*snap.load(), vec![3]);
    }

    #[test]
    fn definition_id_reads_kind_specific_field() {
        let item = serde_json::json!({"bp_id": "weather", "trigger_id": "other"});
        assert_eq!(DefinitionKind::Blueprint.definition_id(&item), Some("weather"));
        assert_eq!(DefinitionKind::Router.definition_id(&item), None);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in DefinitionKind::ALL {
            assert_eq!(DefinitionKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(DefinitionKind::from_name("bogus"), None);
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Refreshable for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn refresh(&self) -> Result<usize, CatalogError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(CatalogError::Unavailable("down".into()))
            } else {
                Ok(n)
            }
        }
    }

    #[tokio::test]
    async fn refresh_logged_reports_outcome() {
        let flaky = Flaky { calls: AtomicUsize::new(0) };
        assert!(!refresh_logged(&flaky).await);
        assert!(refresh_logged(&flaky).await);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_task_ticks_until_cancelled() {
        let flaky = Arc::new(Flaky { calls: AtomicUsize::new(0) });
        let cancel = CancellationToken::new();
        let handle = spawn_refresh(flaky.clone(), Duration::from_secs(120), cancel.clone());

        tokio::time::sleep(Duration::from_secs(370)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }
}
