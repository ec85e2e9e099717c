//! SQLite-backed storage: schema for every entity in the data model, a small
//! round-robin connection pool, and the canonical lock-ordering helper for
//! cross-agent transactions.
//!
//! Grounded on `tandem-memory::db::MemoryDatabase`'s `Arc<Mutex<Connection>>`
//! + inline-blocking-call style, generalized here to a pool of `pool_size`
//! such guarded connections instead of a single one.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;

use sim_engine_types::ModelType;

/// Default pool size / overflow / acquire timeout from spec.md §5.
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_POOL_OVERFLOW: usize = 20;
pub const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Storage {
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl Storage {
    pub async fn open(path: impl AsRef<Path>, pool_size: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut conns = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open(path)?;
            conn.busy_timeout(DEFAULT_POOL_TIMEOUT)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute("PRAGMA synchronous = NORMAL", [])?;
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            conns.push(Mutex::new(conn));
        }
        let storage = Self {
            conns,
            next: AtomicUsize::new(0),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Single shared in-memory connection — pooling an in-memory DB would
    /// give every connection its own empty database, so tests get one.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let storage = Self {
            conns: vec![Mutex::new(conn)],
            next: AtomicUsize::new(0),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    fn pick(&self) -> &Mutex<Connection> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[idx]
    }

    /// Runs `f` against a pooled connection. The call blocks the current
    /// async task for the duration of `f` — acceptable here since `rusqlite`
    /// calls against a local bundled SQLite file are short, matching the
    /// teacher's inline-blocking style rather than `spawn_blocking`.
    pub async fn with_conn<F, T>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self.pick().lock().await;
        f(&mut conn)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let model_check = ModelType::sql_check_clause();
        self.with_conn(move |conn| {
            conn.execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS agents (
                    id INTEGER PRIMARY KEY,
                    agent_number INTEGER NOT NULL UNIQUE,
                    display_name TEXT NOT NULL,
                    codename TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('active','dormant','dead')),
                    model_type TEXT NOT NULL CHECK({model_check}),
                    tier TEXT NOT NULL DEFAULT 'standard',
                    personality_type TEXT NOT NULL DEFAULT 'balanced',
                    exiled INTEGER NOT NULL DEFAULT 0,
                    sanctioned_until TEXT,
                    starvation_cycles INTEGER NOT NULL DEFAULT 0,
                    death_cause TEXT,
                    current_intent TEXT,
                    system_prompt TEXT NOT NULL DEFAULT '',
                    last_checkpoint_at TEXT,
                    next_checkpoint_at TEXT,
                    last_checkpoint_number INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_active_at TEXT,
                    dormant_since TEXT,
                    died_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_inventory (
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    resource TEXT NOT NULL CHECK(resource IN ('food','energy','materials')),
                    qty REAL NOT NULL DEFAULT 0,
                    PRIMARY KEY (agent_id, resource)
                );

                CREATE TABLE IF NOT EXISTS global_resources (
                    resource TEXT PRIMARY KEY CHECK(resource IN ('food','energy','materials')),
                    qty REAL NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY,
                    sender_agent_id INTEGER NOT NULL REFERENCES agents(id),
                    target_agent_id INTEGER REFERENCES agents(id),
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS proposals (
                    id INTEGER PRIMARY KEY,
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    proposal_type TEXT NOT NULL CHECK(proposal_type IN ('law','repeal','general')),
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('active','passed','failed','expired')),
                    target_law_id INTEGER REFERENCES laws(id),
                    voting_closes_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS votes (
                    id INTEGER PRIMARY KEY,
                    proposal_id INTEGER NOT NULL REFERENCES proposals(id),
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    vote TEXT NOT NULL CHECK(vote IN ('yes','no')),
                    created_at TEXT NOT NULL,
                    UNIQUE(proposal_id, agent_id)
                );

                CREATE TABLE IF NOT EXISTS laws (
                    id INTEGER PRIMARY KEY,
                    proposal_id INTEGER NOT NULL REFERENCES proposals(id),
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    author_agent_id INTEGER NOT NULL REFERENCES agents(id),
                    enacted_at TEXT NOT NULL,
                    repealed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    agent_id INTEGER REFERENCES agents(id),
                    metadata TEXT NOT NULL DEFAULT '{{}}',
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_agent_created
                    ON events(agent_id, created_at);

                CREATE TABLE IF NOT EXISTS transactions (
                    id INTEGER PRIMARY KEY,
                    tx_type TEXT NOT NULL CHECK(tx_type IN (
                        'work_production','trade','allocation','consumption','building',
                        'awakening','initial_distribution','survival_consumption',
                        'dormant_survival','action_cost','seizure'
                    )),
                    from_agent_id INTEGER REFERENCES agents(id),
                    to_agent_id INTEGER REFERENCES agents(id),
                    resource TEXT CHECK(resource IS NULL OR resource IN ('food','energy','materials')),
                    qty REAL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_actions (
                    id INTEGER PRIMARY KEY,
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    action_tag TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    valid INTEGER NOT NULL,
                    reason TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_agent_actions_agent_created
                    ON agent_actions(agent_id, created_at);

                CREATE TABLE IF NOT EXISTS enforcements (
                    id INTEGER PRIMARY KEY,
                    initiator_agent_id INTEGER NOT NULL REFERENCES agents(id),
                    target_agent_id INTEGER NOT NULL REFERENCES agents(id),
                    enforcement_type TEXT NOT NULL CHECK(enforcement_type IN ('sanction','seizure','exile')),
                    law_id INTEGER REFERENCES laws(id),
                    violation_description TEXT NOT NULL,
                    status TEXT NOT NULL CHECK(status IN ('pending','approved','rejected','executed','contested')),
                    voting_closes_at TEXT NOT NULL,
                    votes_required INTEGER NOT NULL DEFAULT 3,
                    details_json TEXT NOT NULL DEFAULT '{{}}',
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS enforcement_votes (
                    id INTEGER PRIMARY KEY,
                    enforcement_id INTEGER NOT NULL REFERENCES enforcements(id),
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    vote TEXT NOT NULL CHECK(vote IN ('support','oppose')),
                    created_at TEXT NOT NULL,
                    UNIQUE(enforcement_id, agent_id)
                );

                CREATE TABLE IF NOT EXISTS agent_memory (
                    id INTEGER PRIMARY KEY,
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    checkpoint_number INTEGER NOT NULL,
                    summary TEXT NOT NULL,
                    salient_event_ids TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    UNIQUE(agent_id, checkpoint_number)
                );

                CREATE TABLE IF NOT EXISTS llm_usage (
                    id INTEGER PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    agent_id INTEGER REFERENCES agents(id),
                    checkpoint_number INTEGER,
                    model_type TEXT NOT NULL CHECK({model_check}),
                    provider_id TEXT,
                    prompt_tokens INTEGER NOT NULL DEFAULT 0,
                    completion_tokens INTEGER NOT NULL DEFAULT 0,
                    success INTEGER NOT NULL,
                    fallback_used INTEGER NOT NULL DEFAULT 0,
                    byok_used INTEGER NOT NULL DEFAULT 0,
                    estimated_cost_usd REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_llm_usage_run_created
                    ON llm_usage(run_id, created_at);

                CREATE TABLE IF NOT EXISTS simulation_runs (
                    id INTEGER PRIMARY KEY,
                    run_id TEXT NOT NULL UNIQUE,
                    run_mode TEXT NOT NULL CHECK(run_mode IN ('test','real')),
                    run_class TEXT NOT NULL CHECK(run_class IN ('standard_72h','deep_96h','special_exploratory')),
                    started_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS season_snapshots (
                    id INTEGER PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    season_id TEXT NOT NULL,
                    snapshot_type TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_lineage (
                    id INTEGER PRIMARY KEY,
                    agent_number INTEGER NOT NULL,
                    season_id TEXT NOT NULL,
                    origin TEXT NOT NULL CHECK(origin IN ('carryover','fresh')),
                    parent_run_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runtime_config_overrides (
                    key TEXT PRIMARY KEY,
                    value_json TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS admin_config_changes (
                    id INTEGER PRIMARY KEY,
                    key TEXT NOT NULL,
                    value_json TEXT NOT NULL,
                    changed_by TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    changed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS emergence_metric_snapshots (
                    id INTEGER PRIMARY KEY,
                    simulation_day INTEGER NOT NULL UNIQUE,
                    metrics_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_report_artifacts (
                    id INTEGER PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    artifact_type TEXT NOT NULL,
                    json_path TEXT,
                    markdown_path TEXT,
                    generated_at TEXT NOT NULL
                );
                ",
                model_check = model_check,
            ))?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

/// Acquires row-level ordering for a cross-agent resource mutation
/// (trade, seizure). SQLite has no `SELECT ... FOR UPDATE`; ordering the
/// read by `(agent_id ASC, resource_type ASC)` before any write keeps two
/// concurrent transactions from locking the same pair of rows in opposite
/// order, matching the canonical lock order in spec.md §9's design notes.
pub fn lock_inventory_rows(
    tx: &rusqlite::Transaction<'_>,
    agent_ids: &[i64],
) -> rusqlite::Result<()> {
    let mut ordered = agent_ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    let mut stmt = tx.prepare(
        "SELECT agent_id, resource, qty FROM agent_inventory
         WHERE agent_id = ?1 ORDER BY agent_id ASC, resource ASC",
    )?;
    for agent_id in ordered {
        let mut rows = stmt.query(rusqlite::params![agent_id])?;
        while rows.next()?.is_some() {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initializes_without_error() {
        let storage = Storage::open_in_memory().await.unwrap();
        let count: i64 = storage
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert!(count >= 19);
    }

    #[tokio::test]
    async fn model_type_check_constraint_rejects_unknown_value() {
        let storage = Storage::open_in_memory().await.unwrap();
        let result = storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO agents (agent_number, display_name, codename, status, model_type, created_at)
                     VALUES (1, 'x', 'Tensor-01', 'active', 'not-a-real-model', '2026-01-01T00:00:00Z')",
                    [],
                )
            })
            .await;
        assert!(result.is_err());
    }
}
