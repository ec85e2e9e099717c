//! Daily LLM spend accounting. `llm_usage` rows are written cheaply by
//! `sim-engine-providers::dispatch` without a price lookup; the price table
//! lives here and is applied only when a snapshot is requested, so a price
//! change never requires rewriting historical rows.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::params;

use sim_engine_core::storage::Storage;
use sim_engine_core::time::now_utc;
use sim_engine_types::ModelType;

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

fn price_for(model_type: ModelType) -> ModelPrice {
    match model_type {
        ModelType::ClaudeSonnet4 => ModelPrice { prompt_per_1k: 0.003, completion_per_1k: 0.015 },
        ModelType::ClaudeHaiku => ModelPrice { prompt_per_1k: 0.0008, completion_per_1k: 0.004 },
        ModelType::Gpt4oMini => ModelPrice { prompt_per_1k: 0.00015, completion_per_1k: 0.0006 },
        ModelType::GeminiFlash => ModelPrice { prompt_per_1k: 0.000075, completion_per_1k: 0.0003 },
        ModelType::Llama3_3_70b => ModelPrice { prompt_per_1k: 0.00088, completion_per_1k: 0.00088 },
        ModelType::Llama3_1_8b => ModelPrice { prompt_per_1k: 0.0, completion_per_1k: 0.0 },
        ModelType::OrGptOss120b => ModelPrice { prompt_per_1k: 0.0001, completion_per_1k: 0.0004 },
        ModelType::OrQwen3_235bA22b2507 => ModelPrice { prompt_per_1k: 0.00013, completion_per_1k: 0.0006 },
        ModelType::OrDeepseekV3_2 => ModelPrice { prompt_per_1k: 0.00027, completion_per_1k: 0.0011 },
        ModelType::OrDeepseekChatV3_1 => ModelPrice { prompt_per_1k: 0.00027, completion_per_1k: 0.0011 },
        ModelType::OrGptOss20b => ModelPrice { prompt_per_1k: 0.00005, completion_per_1k: 0.0002 },
        ModelType::OrQwen3_32b => ModelPrice { prompt_per_1k: 0.0001, completion_per_1k: 0.0003 },
        ModelType::OrGptOss20bFree => ModelPrice { prompt_per_1k: 0.0, completion_per_1k: 0.0 },
        ModelType::OrQwen3_4bFree => ModelPrice { prompt_per_1k: 0.0, completion_per_1k: 0.0 },
        ModelType::GrLlama3_1_8bInstant => ModelPrice { prompt_per_1k: 0.00005, completion_per_1k: 0.00008 },
    }
}

#[derive(Debug, Clone, Default)]
pub struct BudgetSnapshot {
    pub day_key: Option<NaiveDate>,
    pub calls_total: u64,
    pub calls_by_provider: HashMap<String, u64>,
    pub estimated_cost_usd: f64,
}

struct UsageRow {
    provider_id: Option<String>,
    model_type: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    byok_used: bool,
}

pub struct UsageBudgetService {
    storage: Arc<Storage>,
}

impl UsageBudgetService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Aggregates today's (UTC) `llm_usage` rows into a `BudgetSnapshot`.
    /// BYOK calls are counted but excluded from `estimated_cost_usd` — the
    /// invariant `byok_used ⇒ estimated_cost_usd contribution == 0` holds by
    /// construction here, not by a post-hoc check.
    pub async fn get_snapshot(&self) -> BudgetSnapshot {
        let today = now_utc().date_naive();
        let day_start = format!("{today}T00:00:00");
        let day_end = format!("{today}T23:59:59.999999");

        let rows = self
            .storage
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider_id, model_type, prompt_tokens, completion_tokens, byok_used
                     FROM llm_usage
                     WHERE created_at >= ?1 AND created_at <= ?2",
                )?;
                let rows = stmt
                    .query_map(params![day_start, day_end], |row| {
                        Ok(UsageRow {
                            provider_id: row.get(0)?,
                            model_type: row.get(1)?,
                            prompt_tokens: row.get(2)?,
                            completion_tokens: row.get(3)?,
                            byok_used: row.get::<_, i64>(4)? != 0,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap_or_default();

        let mut snapshot = BudgetSnapshot {
            day_key: Some(today),
            ..Default::default()
        };

        for row in rows {
            snapshot.calls_total += 1;
            *snapshot
                .calls_by_provider
                .entry(row.provider_id.unwrap_or_else(|| "unknown".to_string()))
                .or_insert(0) += 1;

            if row.byok_used {
                continue;
            }
            if let Ok(model_type) = row.model_type.parse::<ModelType>() {
                let price = price_for(model_type);
                snapshot.estimated_cost_usd += (row.prompt_tokens as f64 / 1000.0) * price.prompt_per_1k
                    + (row.completion_tokens as f64 / 1000.0) * price.completion_per_1k;
            }
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_day_yields_zeroed_snapshot() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let service = UsageBudgetService::new(storage);
        let snapshot = service.get_snapshot().await;
        assert_eq!(snapshot.calls_total, 0);
        assert_eq!(snapshot.estimated_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn byok_calls_are_counted_but_free() {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        storage
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO llm_usage (run_id, model_type, provider_id, prompt_tokens, completion_tokens, success, byok_used, created_at)
                     VALUES ('r1', 'gpt-4o-mini', 'openai', 1000, 1000, 1, 1, ?1)",
                    params![now_utc().to_rfc3339()],
                )
            })
            .await
            .unwrap();
        let service = UsageBudgetService::new(storage);
        let snapshot = service.get_snapshot().await;
        assert_eq!(snapshot.calls_total, 1);
        assert_eq!(snapshot.estimated_cost_usd, 0.0);
    }
}
