//! Daily tick, proposal/enforcement resolution, and emergence metrics.
//! Grounded on `tandem-orchestrator::reducer::DefaultMissionReducer`'s
//! match-on-state, mutate-and-emit-commands shape, generalized from a single
//! mission reducer into four independent idempotent jobs run on a
//! cooperative schedule (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use sim_engine_core::event_bus::EventBus;
use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;
use sim_engine_types::EngineEvent;

/// Survival debit per simulated day. Reproduced alongside `WorkJob::base_yield`
/// in spirit: a small flat draw against food and energy, smaller than a
/// single farm/generate cycle so a working agent stays solvent.
pub const SURVIVAL_FOOD_PER_DAY: f64 = 1.0;
pub const SURVIVAL_ENERGY_PER_DAY: f64 = 1.0;

/// Consecutive zero-food days before an agent is marked dormant, then dead.
pub const STARVATION_DORMANT_THRESHOLD: i64 = 3;
pub const STARVATION_DEATH_THRESHOLD: i64 = 7;

/// Fraction of the target's holdings a seizure enforcement takes.
pub const SEIZURE_FRACTION: f64 = 0.5;
/// Sanction duration once an enforcement of type `sanction` executes.
pub const SANCTION_DURATION_HOURS: i64 = 24;

#[derive(Debug, Default, Clone)]
pub struct DailyTickReport {
    pub agents_processed: usize,
    pub became_dormant: usize,
    pub died: usize,
}

#[derive(Debug, Default, Clone)]
pub struct ProposalResolverReport {
    pub resolved: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone)]
pub struct EnforcementResolverReport {
    pub resolved: usize,
    pub executed: usize,
    pub rejected: usize,
}

struct ActiveAgentRow {
    id: i64,
    starvation_cycles: i64,
}

pub struct Scheduler {
    storage: Arc<Storage>,
    event_bus: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, event_bus: Arc<EventBus>) -> Self {
        Self { storage, event_bus }
    }

    /// Debits survival consumption for every active agent, rolls
    /// `starvation_cycles`, and flips status at the dormant/death thresholds.
    /// Idempotent per agent per call — running it twice for the same day
    /// double-debits resources, so the caller is responsible for invoking it
    /// at most once per UTC day boundary crossing.
    pub async fn run_daily_tick(&self) -> anyhow::Result<DailyTickReport> {
        let now = now_utc();
        let agents = self
            .storage
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, starvation_cycles FROM agents WHERE status = 'active'",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(ActiveAgentRow {
                            id: row.get(0)?,
                            starvation_cycles: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut report = DailyTickReport::default();
        for agent in agents {
            let (became_dormant, died) = self.tick_one_agent(&agent, now).await?;
            report.agents_processed += 1;
            if became_dormant {
                report.became_dormant += 1;
            }
            if died {
                report.died += 1;
            }
        }
        Ok(report)
    }

    async fn tick_one_agent(&self, agent: &ActiveAgentRow, now: DateTime<Utc>) -> anyhow::Result<(bool, bool)> {
        let agent_id = agent.id;
        let now_str = now.to_rfc3339();
        let outcome = self
            .storage
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                let food_before: f64 = tx
                    .query_row(
                        "SELECT qty FROM agent_inventory WHERE agent_id = ?1 AND resource = 'food'",
                        params![agent_id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .unwrap_or(0.0);

                let new_food = (food_before - SURVIVAL_FOOD_PER_DAY).max(0.0);
                tx.execute(
                    "INSERT INTO agent_inventory (agent_id, resource, qty) VALUES (?1, 'food', ?2)
                     ON CONFLICT(agent_id, resource) DO UPDATE SET qty = ?2",
                    params![agent_id, new_food],
                )?;
                tx.execute(
                    "UPDATE agent_inventory SET qty = max(0, qty - ?2)
                     WHERE agent_id = ?1 AND resource = 'energy'",
                    params![agent_id, SURVIVAL_ENERGY_PER_DAY],
                )?;
                tx.execute(
                    "INSERT INTO transactions (tx_type, from_agent_id, to_agent_id, resource, qty, created_at)
                     VALUES ('survival_consumption', ?1, NULL, 'food', ?2, ?3)",
                    params![agent_id, SURVIVAL_FOOD_PER_DAY.min(food_before), now_str],
                )?;

                let starved = new_food <= 0.0;
                let starvation_cycles = if starved { agent.starvation_cycles + 1 } else { 0 };
                tx.execute(
                    "UPDATE agents SET starvation_cycles = ?2 WHERE id = ?1",
                    params![agent_id, starvation_cycles],
                )?;

                let mut became_dormant = false;
                let mut died = false;
                if starvation_cycles >= STARVATION_DEATH_THRESHOLD {
                    tx.execute(
                        "UPDATE agents SET status = 'dead', died_at = ?2, death_cause = 'starvation' WHERE id = ?1",
                        params![agent_id, now_str],
                    )?;
                    died = true;
                } else if starvation_cycles >= STARVATION_DORMANT_THRESHOLD {
                    tx.execute(
                        "UPDATE agents SET status = 'dormant', dormant_since = ?2 WHERE id = ?1 AND status = 'active'",
                        params![agent_id, now_str],
                    )?;
                    became_dormant = true;
                }

                let mut events = Vec::new();
                if died {
                    events.push(
                        EngineEvent::new("agent_died", json!({"cause": "starvation"})).with_agent(agent_id),
                    );
                } else if became_dormant {
                    events.push(EngineEvent::new("became_dormant", json!({})).with_agent(agent_id));
                }
                for event in &events {
                    tx.execute(
                        "INSERT INTO events (event_type, description, agent_id, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            event.event_type,
                            event.description,
                            event.agent_id,
                            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
                            now_str,
                        ],
                    )?;
                }

                tx.commit()?;
                Ok((became_dormant, died, events))
            })
            .await?;

        for event in outcome.2 {
            self.event_bus.publish(event);
        }
        Ok((outcome.0, outcome.1))
    }

    /// Resolves every `active` proposal whose `voting_closes_at` has passed.
    pub async fn run_proposal_resolver(&self) -> anyhow::Result<ProposalResolverReport> {
        let now = now_utc();
        let now_str = now.to_rfc3339();
        let due: Vec<(i64, i64, String, Option<i64>)> = self
            .storage
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_id, proposal_type, target_law_id FROM proposals
                     WHERE status = 'active' AND voting_closes_at <= ?1",
                )?;
                let rows = stmt
                    .query_map(params![now_str], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut report = ProposalResolverReport::default();
        for (proposal_id, author_agent_id, proposal_type, target_law_id) in due {
            let passed = self
                .resolve_one_proposal(proposal_id, author_agent_id, &proposal_type, target_law_id, now)
                .await?;
            report.resolved += 1;
            if passed {
                report.passed += 1;
            } else {
                report.failed += 1;
            }
        }
        Ok(report)
    }

    async fn resolve_one_proposal(
        &self,
        proposal_id: i64,
        author_agent_id: i64,
        proposal_type: &str,
        target_law_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let proposal_type = proposal_type.to_string();
        let now_str = now.to_rfc3339();
        let event = self
            .storage
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                let yes: i64 = tx.query_row(
                    "SELECT count(*) FROM votes WHERE proposal_id = ?1 AND vote = 'yes'",
                    params![proposal_id],
                    |row| row.get(0),
                )?;
                let no: i64 = tx.query_row(
                    "SELECT count(*) FROM votes WHERE proposal_id = ?1 AND vote = 'no'",
                    params![proposal_id],
                    |row| row.get(0),
                )?;
                let passed = yes > no;
                let status = if passed { "passed" } else { "failed" };

                tx.execute(
                    "UPDATE proposals SET status = ?2, resolved_at = ?3 WHERE id = ?1",
                    params![proposal_id, status, now_str],
                )?;

                if passed && proposal_type == "law" {
                    let title: String =
                        tx.query_row("SELECT title FROM proposals WHERE id = ?1", params![proposal_id], |row| {
                            row.get(0)
                        })?;
                    let description: String = tx.query_row(
                        "SELECT description FROM proposals WHERE id = ?1",
                        params![proposal_id],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO laws (proposal_id, title, description, author_agent_id, enacted_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![proposal_id, title, description, author_agent_id, now_str],
                    )?;
                } else if passed && proposal_type == "repeal" {
                    if let Some(law_id) = target_law_id {
                        tx.execute(
                            "UPDATE laws SET repealed_at = ?2 WHERE id = ?1 AND repealed_at IS NULL",
                            params![law_id, now_str],
                        )?;
                    }
                }

                let event = EngineEvent::new(
                    "proposal_resolved",
                    json!({"proposal_id": proposal_id, "result": status, "yes": yes, "no": no}),
                )
                .with_agent(author_agent_id)
                .with_description(format!("proposal {proposal_id} {status}"));
                tx.execute(
                    "INSERT INTO events (event_type, description, agent_id, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.event_type,
                        event.description,
                        event.agent_id,
                        serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
                        now_str,
                    ],
                )?;

                tx.commit()?;
                Ok((passed, event))
            })
            .await?;

        self.event_bus.publish(event.1.clone());
        Ok(event.0)
    }

    /// Resolves every `pending` enforcement whose `voting_closes_at` has
    /// passed, applying sanction/seizure/exile on approval.
    pub async fn run_enforcement_resolver(&self) -> anyhow::Result<EnforcementResolverReport> {
        let now = now_utc();
        let now_str = now.to_rfc3339();
        let due: Vec<(i64, i64, i64, String, i64)> = self
            .storage
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, initiator_agent_id, target_agent_id, enforcement_type, votes_required
                     FROM enforcements WHERE status = 'pending' AND voting_closes_at <= ?1",
                )?;
                let rows = stmt
                    .query_map(params![now_str], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut report = EnforcementResolverReport::default();
        for (enforcement_id, initiator_id, target_id, enforcement_type, votes_required) in due {
            let executed = self
                .resolve_one_enforcement(enforcement_id, initiator_id, target_id, &enforcement_type, votes_required, now)
                .await?;
            report.resolved += 1;
            if executed {
                report.executed += 1;
            } else {
                report.rejected += 1;
            }
        }
        Ok(report)
    }

    async fn resolve_one_enforcement(
        &self,
        enforcement_id: i64,
        initiator_id: i64,
        target_id: i64,
        enforcement_type: &str,
        votes_required: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let enforcement_type = enforcement_type.to_string();
        let now_str = now.to_rfc3339();
        let event = self
            .storage
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                let support: i64 = tx.query_row(
                    "SELECT count(*) FROM enforcement_votes WHERE enforcement_id = ?1 AND vote = 'support'",
                    params![enforcement_id],
                    |row| row.get(0),
                )?;
                let oppose: i64 = tx.query_row(
                    "SELECT count(*) FROM enforcement_votes WHERE enforcement_id = ?1 AND vote = 'oppose'",
                    params![enforcement_id],
                    |row| row.get(0),
                )?;

                let approved = support >= votes_required && support > oppose;
                if !approved {
                    tx.execute(
                        "UPDATE enforcements SET status = 'rejected', resolved_at = ?2 WHERE id = ?1",
                        params![enforcement_id, now_str],
                    )?;
                    let event = EngineEvent::new(
                        "enforcement_failed",
                        json!({"enforcement_id": enforcement_id, "support": support, "oppose": oppose}),
                    )
                    .with_agent(target_id)
                    .with_description(format!("enforcement {enforcement_id} rejected"));
                    tx.execute(
                        "INSERT INTO events (event_type, description, agent_id, metadata, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            event.event_type,
                            event.description,
                            event.agent_id,
                            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
                            now_str,
                        ],
                    )?;
                    tx.commit()?;
                    return Ok((false, event));
                }

                tx.execute(
                    "UPDATE enforcements SET status = 'approved' WHERE id = ?1",
                    params![enforcement_id],
                )?;

                match enforcement_type.as_str() {
                    "sanction" => {
                        let until = (now + chrono::Duration::hours(SANCTION_DURATION_HOURS)).to_rfc3339();
                        tx.execute(
                            "UPDATE agents SET sanctioned_until = ?2 WHERE id = ?1",
                            params![target_id, until],
                        )?;
                    }
                    "exile" => {
                        tx.execute("UPDATE agents SET exiled = 1 WHERE id = ?1", params![target_id])?;
                    }
                    "seizure" => {
                        sim_engine_core::storage::lock_inventory_rows(&tx, &[initiator_id, target_id])?;
                        for resource in sim_engine_types::ResourceType::ALL {
                            let held: f64 = tx
                                .query_row(
                                    "SELECT qty FROM agent_inventory WHERE agent_id = ?1 AND resource = ?2",
                                    params![target_id, resource.as_str()],
                                    |row| row.get(0),
                                )
                                .optional()?
                                .unwrap_or(0.0);
                            let seized = held * SEIZURE_FRACTION;
                            if seized <= 0.0 {
                                continue;
                            }
                            tx.execute(
                                "UPDATE agent_inventory SET qty = qty - ?3 WHERE agent_id = ?1 AND resource = ?2",
                                params![target_id, resource.as_str(), seized],
                            )?;
                            tx.execute(
                                "INSERT INTO agent_inventory (agent_id, resource, qty) VALUES (?1, ?2, ?3)
                                 ON CONFLICT(agent_id, resource) DO UPDATE SET qty = qty + excluded.qty",
                                params![initiator_id, resource.as_str(), seized],
                            )?;
                            tx.execute(
                                "INSERT INTO transactions (tx_type, from_agent_id, to_agent_id, resource, qty, created_at)
                                 VALUES ('seizure', ?1, ?2, ?3, ?4, ?5)",
                                params![target_id, initiator_id, resource.as_str(), seized, now_str],
                            )?;
                        }
                    }
                    _ => {}
                }

                tx.execute(
                    "UPDATE enforcements SET status = 'executed', resolved_at = ?2 WHERE id = ?1",
                    params![enforcement_id, now_str],
                )?;

                let event_type = match enforcement_type.as_str() {
                    "sanction" => "agent_sanctioned",
                    "exile" => "agent_exiled",
                    "seizure" => "resources_seized",
                    _ => "enforcement_executed",
                };
                let event = EngineEvent::new(
                    event_type,
                    json!({"enforcement_id": enforcement_id, "enforcement_type": enforcement_type}),
                )
                .with_agent(target_id)
                .with_description(format!("enforcement {enforcement_id} executed ({enforcement_type})"));
                tx.execute(
                    "INSERT INTO events (event_type, description, agent_id, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.event_type,
                        event.description,
                        event.agent_id,
                        serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
                        now_str,
                    ],
                )?;

                tx.commit()?;
                Ok((true, event))
            })
            .await?;

        self.event_bus.publish(event.1.clone());
        Ok(event.0)
    }

    /// Computes and persists the emergence-metrics snapshot for
    /// `simulation_day`. Idempotent via `UNIQUE(simulation_day)` — a repeat
    /// call is a harmless no-op insert conflict.
    pub async fn run_emergence_metrics(&self, simulation_day: i64) -> anyhow::Result<bool> {
        let now_str = now_utc().to_rfc3339();
        let inserted = self
            .storage
            .with_conn(move |conn| {
                let participating: i64 = conn.query_row(
                    "SELECT count(DISTINCT agent_id) FROM agent_actions WHERE date(created_at) = date('now')",
                    [],
                    |row| row.get(0),
                )?;

                let mut edge_stmt = conn.prepare(
                    "SELECT DISTINCT sender_agent_id, target_agent_id FROM messages
                     WHERE target_agent_id IS NOT NULL AND date(created_at) = date('now')",
                )?;
                let coalition_edges: i64 = edge_stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?
                    .len() as i64;

                let mut wealth_stmt = conn.prepare(
                    "SELECT agent_id, sum(qty) FROM agent_inventory GROUP BY agent_id",
                )?;
                let wealths: Vec<f64> = wealth_stmt
                    .query_map([], |row| row.get::<_, f64>(1))?
                    .collect::<Result<Vec<_>, _>>()?;
                let gini = gini_coefficient(&wealths);

                let conflict_events: i64 = conn.query_row(
                    "SELECT count(*) FROM events
                     WHERE event_type IN ('enforcement_initiated', 'agent_sanctioned', 'agent_exiled', 'resources_seized')
                       AND date(created_at) = date('now')",
                    [],
                    |row| row.get(0),
                )?;
                let cooperation_events: i64 = conn.query_row(
                    "SELECT count(*) FROM transactions WHERE tx_type = 'trade' AND date(created_at) = date('now')",
                    [],
                    |row| row.get(0),
                )?;

                let metrics = json!({
                    "participation": participating,
                    "coalition_edges": coalition_edges,
                    "wealth_gini": gini,
                    "conflict_events": conflict_events,
                    "cooperation_events": cooperation_events,
                });

                let changed = conn.execute(
                    "INSERT OR IGNORE INTO emergence_metric_snapshots (simulation_day, metrics_json, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![simulation_day, metrics.to_string(), now_str],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(inserted)
    }
}

/// Standard Gini coefficient over non-negative values; `0.0` for an empty or
/// single-element population (no inequality to measure).
fn gini_coefficient(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let sum: f64 = sorted.iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    let mut weighted = 0.0;
    for (i, value) in sorted.iter().enumerate() {
        weighted += (i as f64 + 1.0) * value;
    }
    (2.0 * weighted) / (n as f64 * sum) - (n as f64 + 1.0) / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gini_of_equal_wealth_is_zero() {
        let values = vec![5.0, 5.0, 5.0, 5.0];
        assert!(gini_coefficient(&values).abs() < 1e-9);
    }

    #[test]
    fn gini_of_total_inequality_approaches_one() {
        let values = vec![0.0, 0.0, 0.0, 100.0];
        assert!(gini_coefficient(&values) > 0.6);
    }

    #[tokio::test]
    async fn emergence_metrics_snapshot_is_idempotent_per_day() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::new(storage, bus);

        let first = scheduler.run_emergence_metrics(1).await.unwrap();
        let second = scheduler.run_emergence_metrics(1).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn daily_tick_marks_agent_dormant_after_starvation_threshold() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let agent_id = storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO agents (agent_number, display_name, codename, status, model_type, created_at)
                     VALUES (1, 'Tensor-01', 'Tensor-01', 'active', 'claude-haiku', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .unwrap();

        let scheduler = Scheduler::new(storage.clone(), bus);
        for _ in 0..STARVATION_DORMANT_THRESHOLD {
            scheduler.run_daily_tick().await.unwrap();
        }

        let status: String = storage
            .with_conn(move |conn| {
                conn.query_row("SELECT status FROM agents WHERE id = ?1", params![agent_id], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(status, "dormant");
    }
}
