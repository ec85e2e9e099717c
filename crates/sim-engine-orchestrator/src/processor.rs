//! Per-turn orchestration for a single agent: backoff/rate-limit guard,
//! guardrail consultation, context build, model dispatch, then
//! validate-and-execute. Mirrors spec.md §4.5's seven-step sequence.
//!
//! The in-process backoff map is grounded on spec.md §9's design note
//! ("rate-limit backoff: keep as a sharded per-agent map guarded by a
//! mutex") and on the same `Arc<Mutex<HashMap<...>>>` shape
//! `tandem-core::permissions::PermissionManager` uses for its `waiters` map.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;

use sim_engine_core::config::RuntimeConfigService;
use sim_engine_core::event_bus::EventBus;
use sim_engine_core::guardrail::GuardrailService;
use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;
use sim_engine_providers::dispatch::{DispatchRequest, ModelDispatchService};
use sim_engine_providers::routine::InventorySnapshot;
use sim_engine_types::ModelType;

use crate::action_engine::validate_and_execute;
use crate::context::ContextBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Skipped,
    Backoff,
    GuardrailStopped,
    Processed,
}

struct AgentTurnInfo {
    id: i64,
    agent_number: i64,
    display_name: String,
    model_type: ModelType,
    system_prompt: String,
}

pub struct AgentProcessor {
    storage: Arc<Storage>,
    config: Arc<RuntimeConfigService>,
    guardrail: Arc<GuardrailService>,
    dispatch: Arc<ModelDispatchService>,
    context_builder: Arc<ContextBuilder>,
    event_bus: Arc<EventBus>,
    backoff: Mutex<HashMap<i64, DateTime<Utc>>>,
    run_id: String,
}

impl AgentProcessor {
    pub fn new(
        storage: Arc<Storage>,
        config: Arc<RuntimeConfigService>,
        guardrail: Arc<GuardrailService>,
        dispatch: Arc<ModelDispatchService>,
        context_builder: Arc<ContextBuilder>,
        event_bus: Arc<EventBus>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            config,
            guardrail,
            dispatch,
            context_builder,
            event_bus,
            backoff: Mutex::new(HashMap::new()),
            run_id: run_id.into(),
        }
    }

    pub async fn process_turn(&self, agent_id: i64) -> anyhow::Result<TurnOutcome> {
        let now = now_utc();

        if let Some(expiry) = self.backoff.lock().await.get(&agent_id).copied() {
            if now < expiry {
                return Ok(TurnOutcome::Skipped);
            }
        }

        let max_actions = self.config.get_u64("MAX_ACTIONS_PER_HOUR", 4).await;
        let cooldown_buffer = self.config.get_u64("ACTION_RATE_LIMIT_COOLDOWN_BUFFER_SECONDS", 5).await;

        let window_start = now - chrono::Duration::hours(1);
        let (count_in_window, oldest_in_window) = self.actions_in_window(agent_id, window_start).await?;

        if count_in_window >= max_actions {
            let reset_time = oldest_in_window.unwrap_or(now) + chrono::Duration::hours(1);
            let expiry = reset_time + chrono::Duration::seconds(cooldown_buffer as i64);

            let mut backoff = self.backoff.lock().await;
            let already_backed_off = backoff
                .get(&agent_id)
                .map(|existing| *existing >= expiry)
                .unwrap_or(false);
            if !already_backed_off {
                backoff.insert(agent_id, expiry);
                drop(backoff);
                self.record_invalid_action(agent_id, "idle", "rate limit exceeded for this hour").await?;
            }
            return Ok(TurnOutcome::Backoff);
        }

        let decision = self.guardrail.evaluate().await;
        if decision.should_stop {
            return Ok(TurnOutcome::GuardrailStopped);
        }

        let Some(agent) = self.fetch_turn_info(agent_id).await? else {
            return Ok(TurnOutcome::Skipped);
        };

        let context_prompt = self
            .context_builder
            .build(agent.id, agent.agent_number, &agent.display_name)
            .await?;
        let inventory = self.load_inventory(agent_id).await?;
        let checkpoint_number = self.next_checkpoint_number(agent_id).await?;

        let action = self
            .dispatch
            .dispatch(DispatchRequest {
                run_id: &self.run_id,
                agent_id,
                checkpoint_number,
                model_type: agent.model_type,
                system_prompt: &agent.system_prompt,
                context_prompt: &context_prompt,
                inventory,
            })
            .await;

        let cycles_worked_today = self.work_cycles_today(agent_id, now).await?;
        let result = validate_and_execute(&self.storage, agent_id, action, cycles_worked_today).await?;

        for event in &result.events {
            self.event_bus.publish(event.clone());
        }

        if !result.valid {
            let short_backoff = now + chrono::Duration::seconds(cooldown_buffer as i64);
            self.backoff.lock().await.insert(agent_id, short_backoff);
        } else {
            self.backoff.lock().await.remove(&agent_id);
        }

        Ok(TurnOutcome::Processed)
    }

    async fn actions_in_window(
        &self,
        agent_id: i64,
        window_start: DateTime<Utc>,
    ) -> anyhow::Result<(u64, Option<DateTime<Utc>>)> {
        let window_start_str = window_start.to_rfc3339();
        let rows = self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT count(*), min(created_at) FROM agent_actions WHERE agent_id = ?1 AND created_at >= ?2",
                    params![agent_id, window_start_str],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
                )
            })
            .await?;
        let oldest = rows
            .1
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok((rows.0.max(0) as u64, oldest))
    }

    async fn work_cycles_today(&self, agent_id: i64, now: DateTime<Utc>) -> anyhow::Result<i64> {
        let day_start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc().to_rfc3339();
        Ok(self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT count(*) FROM agent_actions
                     WHERE agent_id = ?1 AND action_tag IN ('work', 'produce')
                       AND valid = 1 AND created_at >= ?2",
                    params![agent_id, day_start],
                    |row| row.get(0),
                )
            })
            .await?)
    }

    async fn next_checkpoint_number(&self, agent_id: i64) -> anyhow::Result<i64> {
        Ok(self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT last_checkpoint_number FROM agents WHERE id = ?1",
                    params![agent_id],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .unwrap_or(0)
            + 1)
    }

    async fn fetch_turn_info(&self, agent_id: i64) -> anyhow::Result<Option<AgentTurnInfo>> {
        let row = self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, agent_number, display_name, model_type, system_prompt
                     FROM agents WHERE id = ?1 AND status = 'active'",
                    params![agent_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        Ok(row.and_then(|(id, agent_number, display_name, model_type_raw, system_prompt)| {
            model_type_raw.parse::<ModelType>().ok().map(|model_type| AgentTurnInfo {
                id,
                agent_number,
                display_name,
                model_type,
                system_prompt,
            })
        }))
    }

    async fn load_inventory(&self, agent_id: i64) -> anyhow::Result<InventorySnapshot> {
        let rows = self
            .storage
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT resource, qty FROM agent_inventory WHERE agent_id = ?1")?;
                let rows = stmt
                    .query_map(params![agent_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut snapshot = InventorySnapshot::default();
        for (resource, qty) in rows {
            match resource.as_str() {
                "food" => snapshot.food = qty,
                "energy" => snapshot.energy = qty,
                "materials" => snapshot.materials = qty,
                _ => {}
            }
        }
        Ok(snapshot)
    }

    async fn record_invalid_action(&self, agent_id: i64, action_tag: &str, reason: &str) -> anyhow::Result<()> {
        let now = now_utc().to_rfc3339();
        let agent_id_for_action = agent_id;
        let action_tag_owned = action_tag.to_string();
        let reason_owned = reason.to_string();
        self.storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO agent_actions (agent_id, action_tag, payload, valid, reason, created_at)
                     VALUES (?1, ?2, '{}', 0, ?3, ?4)",
                    params![agent_id_for_action, action_tag_owned, reason_owned, now],
                )?;
                conn.execute(
                    "INSERT INTO events (event_type, description, agent_id, metadata, created_at)
                     VALUES ('invalid_action', ?1, ?2, ?3, ?4)",
                    params![
                        reason_owned,
                        agent_id_for_action,
                        serde_json::json!({"reason": reason_owned}).to_string(),
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_agent(storage: &Storage, agent_number: i64, max_actions_window_actions: i64) -> i64 {
        storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO agents (agent_number, display_name, codename, status, model_type, created_at)
                     VALUES (?1, ?2, ?2, 'active', 'claude-haiku', '2026-01-01T00:00:00Z')",
                    params![agent_number, format!("Tensor-{agent_number:02}")],
                )?;
                let agent_id = conn.last_insert_rowid();
                let now = sim_engine_core::time::now_utc().to_rfc3339();
                for _ in 0..max_actions_window_actions {
                    conn.execute(
                        "INSERT INTO agent_actions (agent_id, action_tag, payload, valid, created_at)
                         VALUES (?1, 'idle', '{}', 1, ?2)",
                        params![agent_id, now],
                    )?;
                }
                Ok(agent_id)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_turn_within_backoff_window_is_skipped_without_a_new_event() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let config = Arc::new(RuntimeConfigService::new(storage.clone()));
        config
            .update_settings(
                [("MAX_ACTIONS_PER_HOUR".to_string(), serde_json::json!(1))]
                    .into_iter()
                    .collect(),
                "test",
                "boundary scenario 1",
            )
            .await
            .unwrap();

        let agent_id = seed_agent(&storage, 1, 1).await;

        let bus = Arc::new(EventBus::new());
        let guardrail = Arc::new(GuardrailService::new(
            config.clone(),
            bus.clone(),
            Arc::new(FixedPool(0.0)),
            Arc::new(FixedFailures(0)),
        ));
        let registry = Arc::new(sim_engine_providers::registry::ProviderRegistry::default());
        let dispatch = Arc::new(ModelDispatchService::new(registry, storage.clone(), 0));
        let context_builder = Arc::new(ContextBuilder::new(storage.clone(), config.clone()));
        let processor = AgentProcessor::new(
            storage.clone(),
            config,
            guardrail,
            dispatch,
            context_builder,
            bus,
            "test-run",
        );

        let first = processor.process_turn(agent_id).await.unwrap();
        assert_eq!(first, TurnOutcome::Backoff);
        let events_after_first: i64 = storage
            .with_conn(|conn| conn.query_row("SELECT count(*) FROM events", [], |row| row.get(0)))
            .await
            .unwrap();

        // The second call hits the backoff map set up by the first call and
        // returns before re-evaluating the rate limit at all.
        let second = processor.process_turn(agent_id).await.unwrap();
        assert_eq!(second, TurnOutcome::Skipped);
        let events_after_second: i64 = storage
            .with_conn(|conn| conn.query_row("SELECT count(*) FROM events", [], |row| row.get(0)))
            .await
            .unwrap();

        assert_eq!(events_after_first, events_after_second);
        assert_eq!(events_after_first, 1);
    }

    struct FixedPool(f64);
    impl sim_engine_core::guardrail::PoolPressureSource for FixedPool {
        fn utilization(&self) -> f64 {
            self.0
        }
    }

    struct FixedFailures(u64);
    impl sim_engine_core::guardrail::ProviderFailureSource for FixedFailures {
        fn failures_in_window(&self, _window_minutes: u64) -> u64 {
            self.0
        }
    }
}
