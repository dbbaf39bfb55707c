use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;

/// Behavior engine parameters. Loaded from the `soma_config` table at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SomaCfg {
    // catalogs
    pub catalog_refresh_secs: u64,

    // scene dispatch
    pub scene_parallel_threshold: usize,
    pub scene_eval_workers: usize,

    // semantic matching
    pub semantic_workers: usize,
    pub semantic_top_k: usize,
    pub semantic_threshold: f32,

    // blueprint routing
    pub self_cancel_limit: u32,
    pub router_max_attempts: u32,
    pub router_event_window: usize,
    pub router_max_hops: usize,

    // action hand-off
    pub action_queue_capacity: usize,
}

impl Default for SomaCfg {
    fn default() -> Self {
        Self {
            catalog_refresh_secs: 120,
            scene_parallel_threshold: 2,
            scene_eval_workers: 4,
            semantic_workers: 10,
            semantic_top_k: 3,
            semantic_threshold: 0.75,
            self_cancel_limit: 5,
            router_max_attempts: 3,
            router_event_window: 6,
            router_max_hops: 16,
            action_queue_capacity: 64,
        }
    }
}

impl SomaCfg {
    /// Load config from `soma_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM soma_config")
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `soma_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO soma_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            catalog_refresh_secs: get_or(m, "catalog_refresh_secs", d.catalog_refresh_secs),
            scene_parallel_threshold: get_or(m, "scene_parallel_threshold", d.scene_parallel_threshold),
            scene_eval_workers: get_or(m, "scene_eval_workers", d.scene_eval_workers).max(1),
            semantic_workers: get_or(m, "semantic_workers", d.semantic_workers).max(1),
            semantic_top_k: get_or(m, "semantic_top_k", d.semantic_top_k),
            semantic_threshold: get_or(m, "semantic_threshold", d.semantic_threshold),
            self_cancel_limit: get_or(m, "self_cancel_limit", d.self_cancel_limit),
            router_max_attempts: get_or(m, "router_max_attempts", d.router_max_attempts).max(1),
            router_event_window: get_or(m, "router_event_window", d.router_event_window),
            router_max_hops: get_or(m, "router_max_hops", d.router_max_hops),
            action_queue_capacity: get_or(m, "action_queue_capacity", d.action_queue_capacity).max(1),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("catalog_refresh_secs", self.catalog_refresh_secs.to_string(), "Catalog reload interval seconds"),
            ("scene_parallel_threshold", self.scene_parallel_threshold.to_string(), "Trigger count above which scene triggers are evaluated concurrently"),
            ("scene_eval_workers", self.scene_eval_workers.to_string(), "Concurrent scene trigger evaluations"),
            ("semantic_workers", self.semantic_workers.to_string(), "Concurrent semantic fragment queries"),
            ("semantic_top_k", self.semantic_top_k.to_string(), "Nearest neighbours per fragment"),
            ("semantic_threshold", self.semantic_threshold.to_string(), "Minimum similarity for a semantic trigger match"),
            ("self_cancel_limit", self.self_cancel_limit.to_string(), "Stalled conversational turns before a blueprint cancels itself"),
            ("router_max_attempts", self.router_max_attempts.to_string(), "LLM routing attempts per router decision"),
            ("router_event_window", self.router_event_window.to_string(), "Recent events included in router prompts"),
            ("router_max_hops", self.router_max_hops.to_string(), "Chained router transitions allowed per event"),
            ("action_queue_capacity", self.action_queue_capacity.to_string(), "Action queue buffer size"),
        ]
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_overrides_and_falls_back() {
        let mut m = HashMap::new();
        m.insert("self_cancel_limit".to_string(), "2".to_string());
        m.insert("semantic_threshold".to_string(), "0.5".to_string());
        m.insert("router_max_attempts".to_string(), "not-a-number".to_string());

        let cfg = SomaCfg::from_map(&m);
        assert_eq!(cfg.self_cancel_limit, 2);
        assert!((cfg.semantic_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.router_max_attempts, 3);
        assert_eq!(cfg.catalog_refresh_secs, 120);
    }

    #[test]
    fn worker_counts_never_zero() {
        let mut m = HashMap::new();
        m.insert("scene_eval_workers".to_string(), "0".to_string());
        m.insert("semantic_workers".to_string(), "0".to_string());
        let cfg = SomaCfg::from_map(&m);
        assert_eq!(cfg.scene_eval_workers, 1);
        assert_eq!(cfg.semantic_workers, 1);
    }

    #[test]
    fn entries_cover_every_field() {
        let cfg = SomaCfg::default();
        let entries = cfg.to_entries();
        let map: HashMap<String, String> =
            entries.iter().map(|(k, v, _)| (k.to_string(), v.clone())).collect();
        let round = SomaCfg::from_map(&map);
        assert_eq!(entries.len(), 11);
        assert_eq!(round.router_max_hops, cfg.router_max_hops);
        assert_eq!(round.action_queue_capacity, cfg.action_queue_capacity);
    }
}
