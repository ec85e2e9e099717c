//! Model dispatch: resolves a `ModelType` to a provider, retries transient
//! failures with exponential backoff, and always returns a usable `Action` —
//! dispatch never propagates an error to its caller (spec.md §4.3, §7).
//!
//! Grounded on `tandem-providers::ProviderRegistry::select_provider` plus a
//! thin retry decorator: the teacher has no retry loop of its own, so this
//! is the expansion's addition, built the teacher's way around its
//! `Provider` trait.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rusqlite::params;

use sim_engine_core::storage::Storage;
use sim_engine_types::{Action, ModelType};

use crate::error::ProviderError;
use crate::registry::ProviderRegistry;
use crate::routine::{InventorySnapshot, RoutineExecutor};

const BASE_BACKOFF: Duration = Duration::from_millis(250);

pub struct DispatchRequest<'a> {
    pub run_id: &'a str,
    pub agent_id: i64,
    pub checkpoint_number: i64,
    pub model_type: ModelType,
    pub system_prompt: &'a str,
    pub context_prompt: &'a str,
    pub inventory: InventorySnapshot,
}

pub struct ModelDispatchService {
    registry: Arc<ProviderRegistry>,
    storage: Arc<Storage>,
    max_retries: u32,
}

impl ModelDispatchService {
    pub fn new(registry: Arc<ProviderRegistry>, storage: Arc<Storage>, max_retries: u32) -> Self {
        Self {
            registry,
            storage,
            max_retries,
        }
    }

    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> Action {
        let Some((provider, model)) = self.registry.resolve(request.model_type) else {
            self.record_usage(&request, "unconfigured", 0, 0, false, true)
                .await;
            return RoutineExecutor::decide(request.inventory);
        };

        let mut attempt = 0;
        loop {
            match provider
                .complete(request.system_prompt, request.context_prompt, model)
                .await
            {
                Ok(text) => {
                    let prompt_tokens = estimate_tokens(request.context_prompt) + estimate_tokens(request.system_prompt);
                    let completion_tokens = estimate_tokens(&text);
                    match serde_json::from_str::<Action>(text.trim()) {
                        Ok(action) => {
                            self.record_usage(
                                &request,
                                &provider.info().id,
                                prompt_tokens,
                                completion_tokens,
                                true,
                                false,
                            )
                            .await;
                            return action;
                        }
                        Err(err) => {
                            tracing::warn!(agent_id = request.agent_id, %err, "model returned unparseable action, falling back");
                            self.record_usage(
                                &request,
                                &provider.info().id,
                                prompt_tokens,
                                completion_tokens,
                                false,
                                true,
                            )
                            .await;
                            return RoutineExecutor::decide(request.inventory);
                        }
                    }
                }
                Err(ProviderError::Permanent(reason)) => {
                    tracing::warn!(agent_id = request.agent_id, reason, "permanent provider error, no retry");
                    self.record_usage(&request, &provider.info().id, 0, 0, false, true)
                        .await;
                    return RoutineExecutor::decide(request.inventory);
                }
                Err(ProviderError::Transient(reason)) => {
                    self.record_usage(&request, &provider.info().id, 0, 0, false, attempt >= self.max_retries)
                        .await;
                    if attempt >= self.max_retries {
                        tracing::warn!(agent_id = request.agent_id, reason, "retries exhausted, falling back");
                        return RoutineExecutor::decide(request.inventory);
                    }
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt)
                        + Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn record_usage(
        &self,
        request: &DispatchRequest<'_>,
        provider_id: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        success: bool,
        fallback_used: bool,
    ) {
        let run_id = request.run_id.to_string();
        let agent_id = request.agent_id;
        let checkpoint_number = request.checkpoint_number;
        let model_type = request.model_type.as_str().to_string();
        let provider_id = provider_id.to_string();
        let now = sim_engine_core::time::now_utc().to_rfc3339();

        let result = self
            .storage
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO llm_usage (
                        run_id, agent_id, checkpoint_number, model_type, provider_id,
                        prompt_tokens, completion_tokens, success, fallback_used, byok_used,
                        estimated_cost_usd, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10)",
                    params![
                        run_id,
                        agent_id,
                        checkpoint_number,
                        model_type,
                        provider_id,
                        prompt_tokens,
                        completion_tokens,
                        success,
                        fallback_used,
                        now,
                    ],
                )
            })
            .await;
        if let Err(err) = result {
            tracing::error!(%err, "failed to record llm_usage row");
        }
    }
}

/// Rough token estimate (characters / 4) used only to populate `llm_usage`
/// when the provider doesn't return a usage block; real accounting belongs
/// to the concrete HTTP response, not this fallback.
fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32 / 4).max(1)
}
