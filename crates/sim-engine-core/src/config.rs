//! Runtime configuration: a single layered map (static defaults → persisted
//! overrides) backed by `runtime_config_overrides`, with a short-TTL read
//! cache and an append-only audit trail in `admin_config_changes`.
//!
//! Narrower than the teacher's six-layer `ConfigStore` since every consumer
//! here only ever asks "override if present, else static default."

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::storage::Storage;
use crate::time::now_utc;

pub const CACHE_TTL: Duration = Duration::from_secs(5);

/// Allowlisted runtime-config keys. Any key outside this set is rejected by
/// `update_settings` — there is no mechanism to configure arbitrary values
/// at runtime.
pub const RUNTIME_CONFIG_KEYS: &[&str] = &[
    "SIMULATION_ACTIVE",
    "SIMULATION_PAUSED",
    "SIMULATION_RUN_MODE",
    "SIMULATION_RUN_ID",
    "STOP_CONDITION_ENFORCEMENT_ENABLED",
    "LLM_DAILY_BUDGET_USD_HARD",
    "STOP_PROVIDER_FAILURE_THRESHOLD",
    "STOP_PROVIDER_FAILURE_WINDOW_MINUTES",
    "STOP_DB_POOL_UTILIZATION_THRESHOLD",
    "STOP_DB_POOL_CONSECUTIVE_CHECKS",
    "MAX_ACTIONS_PER_HOUR",
    "ACTION_RATE_LIMIT_COOLDOWN_BUFFER_SECONDS",
    "PERCEPTION_LAG_SECONDS",
];

fn static_default(key: &str) -> Option<Value> {
    let value = match key {
        "SIMULATION_ACTIVE" => Value::Bool(true),
        "SIMULATION_PAUSED" => Value::Bool(false),
        "SIMULATION_RUN_MODE" => Value::String("test".into()),
        "SIMULATION_RUN_ID" => Value::Null,
        "STOP_CONDITION_ENFORCEMENT_ENABLED" => Value::Bool(true),
        "LLM_DAILY_BUDGET_USD_HARD" => serde_json::json!(25.0),
        "STOP_PROVIDER_FAILURE_THRESHOLD" => serde_json::json!(10),
        "STOP_PROVIDER_FAILURE_WINDOW_MINUTES" => serde_json::json!(15),
        "STOP_DB_POOL_UTILIZATION_THRESHOLD" => serde_json::json!(0.95),
        "STOP_DB_POOL_CONSECUTIVE_CHECKS" => serde_json::json!(3),
        "MAX_ACTIONS_PER_HOUR" => serde_json::json!(4),
        "ACTION_RATE_LIMIT_COOLDOWN_BUFFER_SECONDS" => serde_json::json!(5),
        "PERCEPTION_LAG_SECONDS" => serde_json::json!(10),
        _ => return None,
    };
    Some(value)
}

struct CacheEntry {
    value: Option<Value>,
    fetched_at: Instant,
}

/// Layered runtime config: static defaults overridden by rows persisted in
/// `runtime_config_overrides`, fronted by a short-TTL cache.
pub struct RuntimeConfigService {
    storage: Arc<Storage>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl RuntimeConfigService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Reads the effective value for `key`: the persisted override if one
    /// exists and has not expired from cache, else the static default.
    pub async fn get_effective_value_cached(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.cache.read().await.get(key) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return entry.value.clone();
            }
        }
        let fetched = self.fetch_effective_value(key).await;
        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                value: fetched.clone(),
                fetched_at: Instant::now(),
            },
        );
        fetched
    }

    async fn fetch_effective_value(&self, key: &str) -> Option<Value> {
        let key_owned = key.to_string();
        let override_value = self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT value_json FROM runtime_config_overrides WHERE key = ?1",
                    params![key_owned],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());

        override_value.or_else(|| static_default(key))
    }

    /// Applies a batch of overrides in a single transaction, appends an audit
    /// row per key to `admin_config_changes`, and invalidates the cache for
    /// every key touched. Rejects keys outside `RUNTIME_CONFIG_KEYS`.
    pub async fn update_settings(
        &self,
        updates: HashMap<String, Value>,
        changed_by: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        for key in updates.keys() {
            if !RUNTIME_CONFIG_KEYS.contains(&key.as_str()) {
                anyhow::bail!("unknown runtime config key: {key}");
            }
        }

        let changed_by = changed_by.to_string();
        let reason = reason.to_string();
        let now = now_utc();
        let updates_for_write = updates.clone();
        self.storage
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                for (key, value) in &updates_for_write {
                    let value_json = serde_json::to_string(value)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    tx.execute(
                        "INSERT INTO runtime_config_overrides (key, value_json, updated_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                        params![key, value_json, now.to_rfc3339()],
                    )?;
                    tx.execute(
                        "INSERT INTO admin_config_changes (key, value_json, changed_by, reason, changed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![key, value_json, changed_by, reason, now.to_rfc3339()],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        let mut cache = self.cache.write().await;
        for key in updates.keys() {
            cache.remove(key);
        }
        Ok(())
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_effective_value_cached(key)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_effective_value_cached(key)
            .await
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    pub async fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_effective_value_cached(key)
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }
}
