use thiserror::Error;

/// Top-level engine error taxonomy. The orchestrator and dispatch layers map
/// into this set so guardrails and retry logic can branch on error class
/// rather than parsing messages — see spec.md §7.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("action failed validation: {0}")]
    ValidationFailure(String),

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("run stopped: {0}")]
    StopRequested(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Transient provider errors and nothing else are eligible for retry
    /// with fallback-model dispatch (spec.md §4.3).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientProvider(_))
    }
}
