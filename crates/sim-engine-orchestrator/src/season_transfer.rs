//! Season-boundary snapshot export and next-season seeding.
//! Grounded on `original_source/backend/scripts/export_season_snapshot.py`,
//! `seed_next_season.py`, and `app/services/lineage.py`'s
//! `VALID_LINEAGE_ORIGINS`/season-resolution helpers.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sim_engine_core::identity::immutable_alias_for_agent_number;
use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;

pub const SURVIVOR_SNAPSHOT_TYPE_V1: &str = "survivors_v1";
pub const DEFAULT_TARGET_AGENT_COUNT: i64 = 50;
pub const VALID_LINEAGE_ORIGINS: &[&str] = &["carryover", "fresh"];
pub const DEFAULT_TRANSFER_POLICY_VERSIONS: &[&str] = &["transfer_policy_v1"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivorRecord {
    pub agent_number: i64,
    pub display_name: String,
    pub codename: String,
    pub model_type: String,
    pub tier: String,
    pub personality_type: String,
    pub inventory: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    pub run_id: String,
    pub snapshot_type: String,
    pub dry_run: bool,
    pub survivor_count: usize,
    pub payload: Value,
}

/// Reads every non-dead, non-exiled agent out of `run_id` into a
/// `survivors_v1` payload. Persists a `season_snapshots` row unless
/// `dry_run` is set.
pub async fn export_season_snapshot(
    storage: &Storage,
    run_id: &str,
    snapshot_type: &str,
    dry_run: bool,
) -> anyhow::Result<SnapshotResult> {
    let run_id = run_id.to_string();
    let snapshot_type = snapshot_type.to_string();
    let survivors = storage
        .with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_number, display_name, codename, model_type, tier, personality_type, id
                 FROM agents WHERE status != 'dead' AND exiled = 0 ORDER BY agent_number ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut records = Vec::with_capacity(rows.len());
            for (agent_number, display_name, codename, model_type, tier, personality_type, agent_id) in rows {
                let mut inv_stmt = conn.prepare(
                    "SELECT resource, qty FROM agent_inventory WHERE agent_id = ?1",
                )?;
                let mut inventory = serde_json::Map::new();
                let inv_rows = inv_stmt
                    .query_map(params![agent_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for (resource, qty) in inv_rows {
                    inventory.insert(resource, json!(qty));
                }
                records.push(SurvivorRecord {
                    agent_number,
                    display_name,
                    codename,
                    model_type,
                    tier,
                    personality_type,
                    inventory: Value::Object(inventory),
                });
            }
            Ok(records)
        })
        .await?;

    let payload = json!({ "survivors": survivors });
    let survivor_count = survivors.len();

    if !dry_run {
        let run_id = run_id.clone();
        let snapshot_type = snapshot_type.clone();
        let payload_str = payload.to_string();
        let now_str = now_utc().to_rfc3339();
        let season_id = season_id_for_run(storage, &run_id).await?;
        storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO season_snapshots (run_id, season_id, snapshot_type, payload_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![run_id, season_id, snapshot_type, payload_str, now_str],
                )
            })
            .await?;
    }

    Ok(SnapshotResult {
        run_id,
        snapshot_type,
        dry_run,
        survivor_count,
        payload,
    })
}

/// A `season_id` is just the `run_id` itself in this engine — one season per
/// simulation run — reproduced from `lineage.py`'s fallback to "active or
/// latest run" when no explicit season scoping exists upstream.
async fn season_id_for_run(storage: &Storage, run_id: &str) -> anyhow::Result<String> {
    let run_id_owned = run_id.to_string();
    let exists: Option<String> = storage
        .with_conn(move |conn| {
            conn.query_row(
                "SELECT run_id FROM simulation_runs WHERE run_id = ?1",
                params![run_id_owned],
                |row| row.get(0),
            )
            .optional()
        })
        .await?;
    Ok(exists.unwrap_or_else(|| run_id.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedResult {
    pub season_id: String,
    pub parent_run_id: String,
    pub transfer_policy_version: String,
    pub dry_run: bool,
    pub target_agent_count: i64,
    pub carryover_count: usize,
    pub fresh_count: usize,
    pub laws_carried: usize,
    pub plan: Value,
}

/// Seeds the next season's agent roster from the most recent
/// `survivors_v1` snapshot of `parent_run_id`, filling remaining slots with
/// fresh agents. Requires `confirm` for any non-dry-run write, mirroring
/// `seed_next_season.py`'s destructive-action guard.
#[allow(clippy::too_many_arguments)]
pub async fn seed_next_season(
    storage: &Storage,
    season_id: &str,
    parent_run_id: &str,
    transfer_policy_version: &str,
    target_agent_count: i64,
    carry_passed_laws: bool,
    dry_run: bool,
    confirm: bool,
) -> anyhow::Result<SeedResult> {
    if !DEFAULT_TRANSFER_POLICY_VERSIONS.contains(&transfer_policy_version) {
        anyhow::bail!("unknown transfer policy version: {transfer_policy_version}");
    }
    if !dry_run && !confirm {
        anyhow::bail!("seeding the next season is destructive — pass confirm to run for real");
    }

    let parent_run_id_owned = parent_run_id.to_string();
    let snapshot_json: Option<String> = storage
        .with_conn(move |conn| {
            conn.query_row(
                "SELECT payload_json FROM season_snapshots
                 WHERE run_id = ?1 AND snapshot_type = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![parent_run_id_owned, SURVIVOR_SNAPSHOT_TYPE_V1],
                |row| row.get(0),
            )
            .optional()
        })
        .await?;

    let snapshot_json = snapshot_json
        .ok_or_else(|| anyhow::anyhow!("no survivors_v1 snapshot found for run {parent_run_id}"))?;
    let snapshot: Value = serde_json::from_str(&snapshot_json)?;
    let mut survivors: Vec<SurvivorRecord> = serde_json::from_value(
        snapshot.get("survivors").cloned().unwrap_or_else(|| json!([])),
    )?;
    survivors.sort_by_key(|s| s.agent_number);

    let target = target_agent_count.max(0);
    let carryover: Vec<&SurvivorRecord> = survivors.iter().take(target as usize).collect();
    let fresh_slots = (target as usize).saturating_sub(carryover.len());

    let mut plan_agents = Vec::new();
    let mut next_number = 1i64;
    for survivor in &carryover {
        let agent_number = next_number;
        next_number += 1;
        plan_agents.push(json!({
            "agent_number": agent_number,
            "origin": "carryover",
            "source_agent_number": survivor.agent_number,
            "codename": immutable_alias_for_agent_number(agent_number),
            "model_type": survivor.model_type,
            "tier": survivor.tier,
            "personality_type": survivor.personality_type,
            "inventory": survivor.inventory,
        }));
    }
    for _ in 0..fresh_slots {
        let agent_number = next_number;
        next_number += 1;
        plan_agents.push(json!({
            "agent_number": agent_number,
            "origin": "fresh",
            "source_agent_number": Value::Null,
            "codename": immutable_alias_for_agent_number(agent_number),
            "model_type": Value::Null,
            "tier": "standard",
            "personality_type": "balanced",
            "inventory": Value::Null,
        }));
    }

    let laws: Vec<(i64, String, String, i64)> = if carry_passed_laws {
        storage
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, author_agent_id FROM laws WHERE repealed_at IS NULL",
                )?;
                stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()
            })
            .await?
    } else {
        Vec::new()
    };
    let laws_payload: Vec<Value> = laws
        .iter()
        .map(|(id, title, description, author_agent_id)| {
            json!({"source_law_id": id, "title": title, "description": description, "source_author_agent_id": author_agent_id})
        })
        .collect();

    let plan = json!({
        "season_id": season_id,
        "parent_run_id": parent_run_id,
        "transfer_policy_version": transfer_policy_version,
        "agents": plan_agents.clone(),
        "laws": laws_payload.clone(),
    });

    if !dry_run {
        persist_seed_plan(storage, season_id, parent_run_id, &plan_agents, &laws).await?;
    }

    Ok(SeedResult {
        season_id: season_id.to_string(),
        parent_run_id: parent_run_id.to_string(),
        transfer_policy_version: transfer_policy_version.to_string(),
        dry_run,
        target_agent_count: target,
        carryover_count: carryover.len(),
        fresh_count: fresh_slots,
        laws_carried: laws_payload.len(),
        plan,
    })
}

async fn persist_seed_plan(
    storage: &Storage,
    season_id: &str,
    parent_run_id: &str,
    plan_agents: &[Value],
    laws: &[(i64, String, String, i64)],
) -> anyhow::Result<()> {
    let season_id = season_id.to_string();
    let parent_run_id = parent_run_id.to_string();
    let now_str = now_utc().to_rfc3339();
    let plan_agents = plan_agents.to_vec();
    let laws = laws.to_vec();
    storage
        .with_conn(move |conn| {
            let tx = conn.transaction()?;
            for agent in &plan_agents {
                let agent_number = agent["agent_number"].as_i64().unwrap_or_default();
                let codename = agent["codename"].as_str().unwrap_or_default();
                let origin = agent["origin"].as_str().unwrap_or("fresh");
                let model_type = agent["model_type"].as_str().unwrap_or("claude-haiku");
                let tier = agent["tier"].as_str().unwrap_or("standard");
                let personality_type = agent["personality_type"].as_str().unwrap_or("balanced");

                tx.execute(
                    "INSERT INTO agents (
                        agent_number, display_name, codename, status, model_type, tier,
                        personality_type, created_at
                     ) VALUES (?1, ?2, ?2, 'active', ?3, ?4, ?5, ?6)
                     ON CONFLICT(agent_number) DO NOTHING",
                    params![agent_number, codename, model_type, tier, personality_type, now_str],
                )?;

                if let Value::Object(inventory) = &agent["inventory"] {
                    let agent_id: i64 = tx.query_row(
                        "SELECT id FROM agents WHERE agent_number = ?1",
                        params![agent_number],
                        |row| row.get(0),
                    )?;
                    for (resource, qty) in inventory {
                        tx.execute(
                            "INSERT INTO agent_inventory (agent_id, resource, qty) VALUES (?1, ?2, ?3)
                             ON CONFLICT(agent_id, resource) DO UPDATE SET qty = excluded.qty",
                            params![agent_id, resource, qty.as_f64().unwrap_or(0.0)],
                        )?;
                    }
                }

                if !VALID_LINEAGE_ORIGINS.contains(&origin) {
                    return Err(rusqlite::Error::ToSqlConversionFailure(Box::new(
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid lineage origin"),
                    )));
                }
                tx.execute(
                    "INSERT INTO agent_lineage (agent_number, season_id, origin, parent_run_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![agent_number, season_id, origin, parent_run_id, now_str],
                )?;
            }

            for (source_law_id, title, description, author_agent_id) in &laws {
                tx.execute(
                    "INSERT INTO laws (proposal_id, title, description, author_agent_id, enacted_at)
                     SELECT proposal_id, ?2, ?3, ?4, ?5 FROM laws WHERE id = ?1",
                    params![source_law_id, title, description, author_agent_id, now_str],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_one_survivor(storage: &Storage, run_id: &str) {
        storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO simulation_runs (run_id, run_mode, run_class, started_at)
                     VALUES (?1, 'test', 'standard_72h', '2026-01-01T00:00:00Z')",
                    params![run_id],
                )?;
                conn.execute(
                    "INSERT INTO agents (agent_number, display_name, codename, status, model_type, created_at)
                     VALUES (1, 'Tensor-01', 'Tensor-01', 'active', 'claude-haiku', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO agent_inventory (agent_id, resource, qty) VALUES (1, 'food', 4.0)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let _ = run_id;
    }

    #[tokio::test]
    async fn dry_run_and_real_export_produce_the_same_payload() {
        let storage = Storage::open_in_memory().await.unwrap();
        seed_one_survivor(&storage, "run-a").await;

        let dry = export_season_snapshot(&storage, "run-a", SURVIVOR_SNAPSHOT_TYPE_V1, true)
            .await
            .unwrap();
        let real = export_season_snapshot(&storage, "run-a", SURVIVOR_SNAPSHOT_TYPE_V1, false)
            .await
            .unwrap();
        assert_eq!(dry.payload, real.payload);
        assert_eq!(real.survivor_count, 1);
    }

    #[tokio::test]
    async fn seed_next_season_without_confirm_is_rejected() {
        let storage = Storage::open_in_memory().await.unwrap();
        seed_one_survivor(&storage, "run-a").await;
        export_season_snapshot(&storage, "run-a", SURVIVOR_SNAPSHOT_TYPE_V1, false)
            .await
            .unwrap();

        let result = seed_next_season(
            &storage,
            "season-2",
            "run-a",
            "transfer_policy_v1",
            DEFAULT_TARGET_AGENT_COUNT,
            false,
            false,
            false,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn seed_next_season_dry_run_matches_confirmed_plan() {
        let storage = Storage::open_in_memory().await.unwrap();
        seed_one_survivor(&storage, "run-a").await;
        export_season_snapshot(&storage, "run-a", SURVIVOR_SNAPSHOT_TYPE_V1, false)
            .await
            .unwrap();

        let dry = seed_next_season(&storage, "season-2", "run-a", "transfer_policy_v1", 2, false, true, false)
            .await
            .unwrap();
        let real = seed_next_season(&storage, "season-2", "run-a", "transfer_policy_v1", 2, false, false, true)
            .await
            .unwrap();
        assert_eq!(dry.plan, real.plan);
    }
}
