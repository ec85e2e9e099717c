//! Builds the per-agent textual context snapshot dispatched to the model.
//! Grounded on `tandem-memory::manager`'s summary-assembly style: plain
//! `String` building via `push_str`, no templating engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;

use sim_engine_core::config::RuntimeConfigService;
use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;
use sim_engine_memory::salience::detect_salient_events;
use sim_engine_types::{EngineEvent, ResourceType};

pub struct ContextBuilder {
    storage: Arc<Storage>,
    config: Arc<RuntimeConfigService>,
}

struct ActionBudget {
    used: u64,
    max: u64,
    next_reset: DateTime<Utc>,
}

impl ContextBuilder {
    pub fn new(storage: Arc<Storage>, config: Arc<RuntimeConfigService>) -> Self {
        Self { storage, config }
    }

    /// Builds the context prompt for `agent_id`. `agent_number` and
    /// `display_name` are passed in by the caller since the processor has
    /// already loaded the agent row for its own turn bookkeeping.
    pub async fn build(&self, agent_id: i64, agent_number: i64, display_name: &str) -> anyhow::Result<String> {
        let perception_lag = self.config.get_u64("PERCEPTION_LAG_SECONDS", 10).await;
        let max_actions = self.config.get_u64("MAX_ACTIONS_PER_HOUR", 4).await;
        let now = now_utc();
        let visible_before = now - chrono::Duration::seconds(perception_lag as i64);

        let inventory = self.load_inventory(agent_id).await?;
        let recent_events = self.load_recent_events(visible_before).await?;
        let salient = detect_salient_events(&recent_events, agent_id, 8);
        let laws = self.load_active_laws().await?;
        let proposals = self.load_open_proposals().await?;
        let budget = self.compute_action_budget(agent_id, max_actions, now).await?;

        let mut out = String::new();
        out.push_str(&format!("You are {display_name} (agent #{agent_number}).\n\n"));

        out.push_str("## Inventory\n");
        for resource in ResourceType::ALL {
            out.push_str(&format!("- {resource}: {:.2}\n", inventory.amount(resource)));
        }

        out.push_str("\n## Active laws\n");
        if laws.is_empty() {
            out.push_str("- none\n");
        } else {
            for law in &laws {
                out.push_str(&format!("- {law}\n"));
            }
        }

        out.push_str("\n## Proposals you may vote on\n");
        if proposals.is_empty() {
            out.push_str("- none\n");
        } else {
            for proposal in &proposals {
                out.push_str(&format!("- {proposal}\n"));
            }
        }

        out.push_str("\n## Recent salient events\n");
        if salient.is_empty() {
            out.push_str("- none\n");
        } else {
            for event in &salient {
                out.push_str(&format!("- {}: {}\n", event.event_type, event.description));
            }
        }

        out.push_str("\n## Action budget\n");
        out.push_str(&format!("- Actions used this hour: {}/{}\n", budget.used, budget.max));
        out.push_str(&format!(
            "- Remaining actions this hour: {}\n",
            budget.max.saturating_sub(budget.used)
        ));
        out.push_str(&format!(
            "- Next action slot reset (UTC): {}\n",
            budget.next_reset.to_rfc3339()
        ));

        Ok(out)
    }

    async fn load_inventory(&self, agent_id: i64) -> anyhow::Result<sim_engine_providers::routine::InventorySnapshot> {
        let rows = self
            .storage
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT resource, qty FROM agent_inventory WHERE agent_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![agent_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut snapshot = sim_engine_providers::routine::InventorySnapshot::default();
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

    async fn load_recent_events(&self, visible_before: DateTime<Utc>) -> anyhow::Result<Vec<EngineEvent>> {
        let cutoff = visible_before.to_rfc3339();
        let rows = self
            .storage
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, event_type, description, agent_id, metadata, created_at
                     FROM events WHERE created_at <= ?1 ORDER BY id DESC LIMIT 50",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], |row| {
                        let metadata_raw: String = row.get(4)?;
                        let created_at_raw: String = row.get(5)?;
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            metadata_raw,
                            created_at_raw,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, event_type, description, agent_id, metadata_raw, created_at_raw)| EngineEvent {
                id: Some(sim_engine_types::EventId(id)),
                event_type,
                description,
                agent_id,
                metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
                created_at: DateTime::parse_from_rfc3339(&created_at_raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(visible_before),
            })
            .collect())
    }

    async fn load_active_laws(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .storage
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT title FROM laws WHERE repealed_at IS NULL ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?)
    }

    async fn load_open_proposals(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .storage
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title FROM proposals WHERE status = 'active' ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(format!("#{} {}", row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?)
    }

    async fn compute_action_budget(&self, agent_id: i64, max: u64, now: DateTime<Utc>) -> anyhow::Result<ActionBudget> {
        let window_start = (now - chrono::Duration::hours(1)).to_rfc3339();
        let used: i64 = self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT count(*) FROM agent_actions WHERE agent_id = ?1 AND created_at >= ?2",
                    params![agent_id, window_start],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(ActionBudget {
            used: used as u64,
            max,
            next_reset: now + chrono::Duration::hours(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_includes_action_budget_substrings() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let config = Arc::new(RuntimeConfigService::new(storage.clone()));
        config
            .update_settings(
                [("MAX_ACTIONS_PER_HOUR".to_string(), serde_json::json!(3))]
                    .into_iter()
                    .collect(),
                "test",
                "set up boundary scenario",
            )
            .await
            .unwrap();

        let agent_id = storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO agents (agent_number, display_name, codename, status, model_type, created_at)
                     VALUES (1, 'Tensor-01', 'Tensor-01', 'active', 'claude-haiku', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                let agent_id = conn.last_insert_rowid();
                let now = sim_engine_core::time::now_utc().to_rfc3339();
                conn.execute(
                    "INSERT INTO agent_actions (agent_id, action_tag, payload, valid, created_at)
                     VALUES (?1, 'idle', '{}', 1, ?2)",
                    params![agent_id, now],
                )?;
                conn.execute(
                    "INSERT INTO agent_actions (agent_id, action_tag, payload, valid, created_at)
                     VALUES (?1, 'idle', '{}', 1, ?2)",
                    params![agent_id, now],
                )?;
                Ok(agent_id)
            })
            .await
            .unwrap();

        let builder = ContextBuilder::new(storage, config);
        let context = builder.build(agent_id, 1, "Tensor-01").await.unwrap();

        assert!(context.contains("- Actions used this hour: 2/3"));
        assert!(context.contains("- Remaining actions this hour: 1"));
        assert!(context.contains("- Next action slot reset (UTC):"));
    }
}
