//! Epoch champion selection: a deterministic score over survival time,
//! wealth, law authorship, and enforcement record, reproduced from
//! `original_source/backend/scripts/select_epoch_tournament_candidates.py`'s
//! CLI contract and scored/reduced in the style of
//! `tandem-orchestrator::reducer::DefaultMissionReducer` (pure function over
//! a snapshot, no side effects besides the optional artifact write).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;

use crate::run_reports::{write_run_report_artifact, RunReportArtifact};

pub const SCORING_POLICY_VERSION_V1: &str = "scoring_policy_v1";
pub const DEFAULT_CHAMPIONS_PER_SEASON: i64 = 3;
pub const DEFAULT_TARGET_CHAMPIONS: i64 = 0;

const LAW_AUTHORSHIP_WEIGHT: f64 = 5.0;
const ENFORCEMENT_INITIATED_WEIGHT: f64 = 2.0;
const ENFORCEMENT_RECEIVED_WEIGHT: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub season_id: String,
    pub agent_number: i64,
    pub champion_score: f64,
    pub selection_status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TournamentSelection {
    pub epoch_id: String,
    pub season_ids: Vec<String>,
    pub candidate_count: usize,
    pub eligible_count: usize,
    pub selected_count: usize,
    pub selected: Vec<CandidateScore>,
    pub artifacts: Vec<RunReportArtifact>,
}

struct AgentFact {
    agent_number: i64,
    id: i64,
    created_at: DateTime<Utc>,
    died_at: Option<DateTime<Utc>>,
}

/// Selects the top `champions_per_season` agents per season by
/// `champion_score`, optionally capped at `target_total_champions` overall,
/// ties broken by ascending `agent_number` for determinism under identical
/// inputs.
#[allow(clippy::too_many_arguments)]
pub async fn select_epoch_tournament_candidates(
    storage: &Storage,
    epoch_id: &str,
    season_ids: Vec<String>,
    champions_per_season: i64,
    target_total_champions: Option<i64>,
    scoring_policy_version: &str,
    write_artifacts: bool,
) -> anyhow::Result<TournamentSelection> {
    let champions_per_season = champions_per_season.max(1);
    let scoring_policy_version = if scoring_policy_version.is_empty() {
        SCORING_POLICY_VERSION_V1.to_string()
    } else {
        scoring_policy_version.to_string()
    };

    let season_ids = if season_ids.is_empty() {
        distinct_season_ids(storage).await?
    } else {
        season_ids
    };

    let mut all_candidates: Vec<CandidateScore> = Vec::new();
    let mut candidate_count = 0usize;
    let mut eligible_count = 0usize;

    for season_id in &season_ids {
        let facts = agents_in_season(storage, season_id).await?;
        candidate_count += facts.len();
        let mut scored = Vec::with_capacity(facts.len());
        for fact in &facts {
            let score = champion_score(storage, fact).await?;
            scored.push((fact.agent_number, score));
        }
        eligible_count += scored.len();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        for (rank, (agent_number, score)) in scored.into_iter().enumerate() {
            let selection_status = if rank < champions_per_season as usize {
                "selected"
            } else {
                "eligible_not_selected"
            };
            all_candidates.push(CandidateScore {
                season_id: season_id.clone(),
                agent_number,
                champion_score: score,
                selection_status: selection_status.to_string(),
            });
        }
    }

    // Apply the overall cap across all seasons, keeping `selected` rows
    // sorted by score, tie-broken by agent_number — a second pass over the
    // already-per-season-ranked list.
    if let Some(cap) = target_total_champions {
        if cap > 0 {
            let mut selected_indices: Vec<usize> = all_candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.selection_status == "selected")
                .map(|(i, _)| i)
                .collect();
            selected_indices.sort_by(|&i, &j| {
                all_candidates[j]
                    .champion_score
                    .partial_cmp(&all_candidates[i].champion_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(all_candidates[i].agent_number.cmp(&all_candidates[j].agent_number))
            });
            for &i in selected_indices.iter().skip(cap as usize) {
                all_candidates[i].selection_status = "eligible_not_selected".to_string();
            }
        }
    }

    let selected: Vec<CandidateScore> = all_candidates
        .iter()
        .filter(|c| c.selection_status == "selected")
        .cloned()
        .collect();
    let selected_count = selected.len();

    let artifacts = if write_artifacts {
        let payload = json!({
            "epoch_id": epoch_id,
            "season_ids": season_ids,
            "candidate_count": candidate_count,
            "eligible_count": eligible_count,
            "selected_count": selected_count,
            "selected": selected,
            "scoring_policy_version": scoring_policy_version,
        });
        let artifact = write_run_report_artifact(
            storage,
            epoch_id,
            "epoch_tournament",
            "output/reports/epochs",
            &payload,
        )
        .await?;
        vec![artifact]
    } else {
        Vec::new()
    };

    Ok(TournamentSelection {
        epoch_id: epoch_id.to_string(),
        season_ids,
        candidate_count,
        eligible_count,
        selected_count,
        selected,
        artifacts,
    })
}

async fn distinct_season_ids(storage: &Storage) -> anyhow::Result<Vec<String>> {
    let ids = storage
        .with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT season_id FROM agent_lineage ORDER BY season_id ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await?;
    Ok(ids)
}

async fn agents_in_season(storage: &Storage, season_id: &str) -> anyhow::Result<Vec<AgentFact>> {
    let season_id = season_id.to_string();
    let rows = storage
        .with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT a.agent_number, a.id, a.created_at, a.died_at
                 FROM agent_lineage al
                 JOIN agents a ON a.agent_number = al.agent_number
                 WHERE al.season_id = ?1
                 ORDER BY a.agent_number ASC",
            )?;
            let mapped = stmt
                .query_map(params![season_id], |row| {
                    let created_at: String = row.get(2)?;
                    let died_at: Option<String> = row.get(3)?;
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, created_at, died_at))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(mapped)
        })
        .await?;

    let mut facts = Vec::with_capacity(rows.len());
    for (agent_number, id, created_at, died_at) in rows {
        facts.push(AgentFact {
            agent_number,
            id,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| now_utc()),
            died_at: died_at.and_then(|value| {
                DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        });
    }
    Ok(facts)
}

async fn champion_score(storage: &Storage, fact: &AgentFact) -> anyhow::Result<f64> {
    let agent_id = fact.id;
    let survival_end = fact.died_at.unwrap_or_else(now_utc);
    let survival_days = (survival_end - fact.created_at).num_seconds().max(0) as f64 / 86_400.0;

    let (wealth, laws_authored, initiated, received) = storage
        .with_conn(move |conn| {
            let wealth: f64 = conn
                .query_row(
                    "SELECT sum(qty) FROM agent_inventory WHERE agent_id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0.0);
            let laws_authored: i64 = conn.query_row(
                "SELECT count(*) FROM laws WHERE author_agent_id = ?1",
                params![agent_id],
                |row| row.get(0),
            )?;
            let initiated: i64 = conn.query_row(
                "SELECT count(*) FROM enforcements WHERE initiator_agent_id = ?1 AND status = 'executed'",
                params![agent_id],
                |row| row.get(0),
            )?;
            let received: i64 = conn.query_row(
                "SELECT count(*) FROM enforcements WHERE target_agent_id = ?1 AND status = 'executed'",
                params![agent_id],
                |row| row.get(0),
            )?;
            Ok((wealth, laws_authored, initiated, received))
        })
        .await?;

    Ok(survival_days
        + wealth
        + laws_authored as f64 * LAW_AUTHORSHIP_WEIGHT
        + initiated as f64 * ENFORCEMENT_INITIATED_WEIGHT
        - received as f64 * ENFORCEMENT_RECEIVED_WEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_agent(storage: &Storage, agent_number: i64, season_id: &str, wealth: f64) {
        storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO agents (agent_number, display_name, codename, status, model_type, created_at)
                     VALUES (?1, ?1, ?1, 'active', 'claude-haiku', '2026-01-01T00:00:00Z')",
                    params![agent_number.to_string()],
                )?;
                let agent_id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO agent_inventory (agent_id, resource, qty) VALUES (?1, 'food', ?2)",
                    params![agent_id, wealth],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let agent_number = agent_number;
        let season_id = season_id.to_string();
        storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO agent_lineage (agent_number, season_id, origin, parent_run_id, created_at)
                     VALUES (?1, ?2, 'fresh', NULL, '2026-01-01T00:00:00Z')",
                    params![agent_number, season_id],
                )
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn selection_is_deterministic_and_ranks_by_wealth() {
        let storage = Storage::open_in_memory().await.unwrap();
        seed_agent(&storage, 1, "season-a", 10.0).await;
        seed_agent(&storage, 2, "season-a", 50.0).await;
        seed_agent(&storage, 3, "season-a", 5.0).await;

        let first = select_epoch_tournament_candidates(
            &storage,
            "epoch-1",
            vec!["season-a".to_string()],
            1,
            None,
            SCORING_POLICY_VERSION_V1,
            false,
        )
        .await
        .unwrap();
        let second = select_epoch_tournament_candidates(
            &storage,
            "epoch-1",
            vec!["season-a".to_string()],
            1,
            None,
            SCORING_POLICY_VERSION_V1,
            false,
        )
        .await
        .unwrap();

        assert_eq!(first.selected.len(), 1);
        assert_eq!(first.selected[0].agent_number, 2);
        assert_eq!(first.selected[0].champion_score, second.selected[0].champion_score);
        assert_eq!(first.selected[0].agent_number, second.selected[0].agent_number);
    }

    #[tokio::test]
    async fn target_total_champions_caps_overall_selection() {
        let storage = Storage::open_in_memory().await.unwrap();
        seed_agent(&storage, 1, "season-a", 10.0).await;
        seed_agent(&storage, 2, "season-b", 20.0).await;

        let result = select_epoch_tournament_candidates(
            &storage,
            "epoch-1",
            vec!["season-a".to_string(), "season-b".to_string()],
            1,
            Some(1),
            SCORING_POLICY_VERSION_V1,
            false,
        )
        .await
        .unwrap();
        assert_eq!(result.selected_count, 1);
        assert_eq!(result.selected[0].agent_number, 2);
    }
}
