//! Thin run-report artifact contract backing the `export-run-report`,
//! `generate-next-run-plan`, and `rebuild-run-bundle` CLI entries.
//! Report prose/archive generation is out of scope (spec.md §1) — only the
//! JSON + Markdown artifact pair and its `run_report_artifacts` ledger row
//! are implemented here, grounded on
//! `original_source/backend/scripts/export_run_report.py` and
//! `rebuild_run_bundle.py`'s thin-CLI-over-a-service shape.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;

use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;

#[derive(Debug, Clone, Serialize)]
pub struct RunReportArtifact {
    pub run_id: String,
    pub artifact_type: String,
    pub json_path: String,
    pub markdown_path: String,
    pub generated_at: DateTime<Utc>,
}

/// Serializes `payload` to `{dir}/{run_id}.json` and a minimal Markdown
/// summary at `{dir}/{run_id}.md`, records a `run_report_artifacts` row, and
/// returns the pair's paths. Writing to disk is best-effort: a failure to
/// create the output directory does not fail the database record, matching
/// the CLI scripts' behavior of always printing a JSON result.
pub async fn write_run_report_artifact(
    storage: &Storage,
    run_id: &str,
    artifact_type: &str,
    dir: &str,
    payload: &Value,
) -> anyhow::Result<RunReportArtifact> {
    let json_path = PathBuf::from(dir).join(format!("{run_id}.json"));
    let markdown_path = PathBuf::from(dir).join(format!("{run_id}.md"));

    if std::fs::create_dir_all(dir).is_ok() {
        let _ = std::fs::write(&json_path, serde_json::to_string_pretty(payload)?);
        let _ = std::fs::write(&markdown_path, render_markdown_summary(run_id, artifact_type, payload));
    }

    let generated_at = now_utc();
    let run_id_owned = run_id.to_string();
    let artifact_type_owned = artifact_type.to_string();
    let json_path_str = json_path.to_string_lossy().to_string();
    let markdown_path_str = markdown_path.to_string_lossy().to_string();
    let generated_at_str = generated_at.to_rfc3339();

    storage
        .with_conn({
            let json_path_str = json_path_str.clone();
            let markdown_path_str = markdown_path_str.clone();
            move |conn| {
                conn.execute(
                    "INSERT INTO run_report_artifacts (run_id, artifact_type, json_path, markdown_path, generated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![run_id_owned, artifact_type_owned, json_path_str, markdown_path_str, generated_at_str],
                )
            }
        })
        .await?;

    Ok(RunReportArtifact {
        run_id: run_id.to_string(),
        artifact_type: artifact_type.to_string(),
        json_path: json_path_str,
        markdown_path: markdown_path_str,
        generated_at,
    })
}

fn render_markdown_summary(run_id: &str, artifact_type: &str, payload: &Value) -> String {
    format!(
        "# {artifact_type} — {run_id}\n\n```json\n{}\n```\n",
        serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string())
    )
}

/// Backs `export-run-report`: summarizes llm usage, survivor count, and
/// event totals for a run into a `run_summary` artifact pair.
pub async fn export_run_report(
    storage: &Storage,
    run_id: &str,
    condition_name: Option<&str>,
    season_number: Option<i64>,
) -> anyhow::Result<RunReportArtifact> {
    let run_id_owned = run_id.to_string();
    let (agents_total, agents_alive, events_total, llm_calls) = storage
        .with_conn(move |conn| {
            let agents_total: i64 = conn.query_row("SELECT count(*) FROM agents", [], |row| row.get(0))?;
            let agents_alive: i64 =
                conn.query_row("SELECT count(*) FROM agents WHERE status != 'dead'", [], |row| row.get(0))?;
            let events_total: i64 = conn.query_row("SELECT count(*) FROM events", [], |row| row.get(0))?;
            let llm_calls: i64 = conn.query_row(
                "SELECT count(*) FROM llm_usage WHERE run_id = ?1",
                params![run_id_owned],
                |row| row.get(0),
            )?;
            Ok((agents_total, agents_alive, events_total, llm_calls))
        })
        .await?;

    let payload = serde_json::json!({
        "run_id": run_id,
        "condition_name": condition_name,
        "season_number": season_number,
        "agents_total": agents_total,
        "agents_alive": agents_alive,
        "events_total": events_total,
        "llm_calls": llm_calls,
    });
    write_run_report_artifact(storage, run_id, "run_summary", "output/reports/runs", &payload).await
}

/// Backs `generate-next-run-plan`: proposes the next run's class/mode based
/// on whether the current run's survivor count clears a minimum bar.
pub async fn generate_next_run_plan(storage: &Storage, run_id: &str) -> anyhow::Result<RunReportArtifact> {
    let agents_alive: i64 = storage
        .with_conn(|conn| conn.query_row("SELECT count(*) FROM agents WHERE status != 'dead'", [], |row| row.get(0)))
        .await?;

    let recommended_run_class = if agents_alive >= 10 {
        "standard_72h"
    } else {
        "special_exploratory"
    };
    let payload = serde_json::json!({
        "run_id": run_id,
        "agents_alive": agents_alive,
        "recommended_run_class": recommended_run_class,
    });
    write_run_report_artifact(storage, run_id, "next_run_plan", "output/reports/plans", &payload).await
}

/// Backs `rebuild-run-bundle`: regenerates the run-summary artifact pair
/// under a caller-supplied actor id, for re-running after an artifact is
/// lost or the summary logic changes.
pub async fn rebuild_run_bundle(
    storage: &Storage,
    run_id: &str,
    actor_id: &str,
    condition_name: Option<&str>,
    season_number: Option<i64>,
) -> anyhow::Result<RunReportArtifact> {
    let artifact = export_run_report(storage, run_id, condition_name, season_number).await?;
    let now_str = now_utc().to_rfc3339();
    let run_id_owned = run_id.to_string();
    let actor_id_owned = actor_id.to_string();
    storage
        .with_conn(move |conn| {
            conn.execute(
                "INSERT INTO admin_config_changes (key, value_json, changed_by, reason, changed_at)
                 VALUES ('run_bundle_rebuild', ?1, ?2, 'rebuild-run-bundle', ?3)",
                params![run_id_owned, actor_id_owned, now_str],
            )
        })
        .await?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn export_run_report_records_an_artifact_row() {
        let storage = Storage::open_in_memory().await.unwrap();
        let artifact = export_run_report(&storage, "run-a", None, None).await.unwrap();
        assert_eq!(artifact.run_id, "run-a");

        let count: i64 = storage
            .with_conn(|conn| conn.query_row("SELECT count(*) FROM run_report_artifacts", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rebuild_run_bundle_logs_the_actor() {
        let storage = Storage::open_in_memory().await.unwrap();
        rebuild_run_bundle(&storage, "run-a", "operator-1", Some("baseline"), Some(1))
            .await
            .unwrap();

        let changed_by: String = storage
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT changed_by FROM admin_config_changes WHERE key = 'run_bundle_rebuild'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(changed_by, "operator-1");
    }
}
