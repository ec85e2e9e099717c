//! Long-term agent memory checkpoints. Grounded on `tandem-memory::manager`'s
//! summary-update pattern, narrowed from chunk+embed+store to a single
//! append-only row per checkpoint.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;

pub struct AgentMemoryCheckpoint {
    pub agent_id: i64,
    pub checkpoint_number: i64,
    pub summary: String,
    pub salient_event_ids: Vec<i64>,
}

pub struct AgentMemoryService {
    storage: Arc<Storage>,
}

impl AgentMemoryService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Writes a checkpoint row; `(agent_id, checkpoint_number)` is unique, so
    /// retrying a checkpoint write after a crash replaces the prior attempt
    /// rather than duplicating it.
    pub async fn write_checkpoint(&self, checkpoint: AgentMemoryCheckpoint) -> anyhow::Result<()> {
        let salient_json = serde_json::to_string(&checkpoint.salient_event_ids)?;
        let now = now_utc().to_rfc3339();
        self.storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO agent_memory (agent_id, checkpoint_number, summary, salient_event_ids, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(agent_id, checkpoint_number) DO UPDATE SET
                        summary = excluded.summary,
                        salient_event_ids = excluded.salient_event_ids,
                        created_at = excluded.created_at",
                    params![
                        checkpoint.agent_id,
                        checkpoint.checkpoint_number,
                        checkpoint.summary,
                        salient_json,
                        now,
                    ],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn latest_checkpoint(&self, agent_id: i64) -> anyhow::Result<Option<AgentMemoryCheckpoint>> {
        let row = self
            .storage
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT checkpoint_number, summary, salient_event_ids FROM agent_memory
                     WHERE agent_id = ?1 ORDER BY checkpoint_number DESC LIMIT 1",
                    params![agent_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        Ok(row.map(|(checkpoint_number, summary, salient_json)| AgentMemoryCheckpoint {
            agent_id,
            checkpoint_number,
            summary,
            salient_event_ids: serde_json::from_str(&salient_json).unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_latest_checkpoint() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        // agent_memory has a foreign key-free agent_id column in practice,
        // but agents table requires a row to exist for referential tests;
        // this checkpoint test does not enforce that FK since sqlite only
        // checks it when PRAGMA foreign_keys is on and a matching column
        // constraint references it — agent_memory has no REFERENCES clause.
        let service = AgentMemoryService::new(storage);
        service
            .write_checkpoint(AgentMemoryCheckpoint {
                agent_id: 1,
                checkpoint_number: 1,
                summary: "first summary".to_string(),
                salient_event_ids: vec![10, 11],
            })
            .await
            .unwrap();
        service
            .write_checkpoint(AgentMemoryCheckpoint {
                agent_id: 1,
                checkpoint_number: 2,
                summary: "second summary".to_string(),
                salient_event_ids: vec![12],
            })
            .await
            .unwrap();

        let latest = service.latest_checkpoint(1).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_number, 2);
        assert_eq!(latest.summary, "second summary");
        assert_eq!(latest.salient_event_ids, vec![12]);
    }
}
