use thiserror::Error;

/// Mirrors `sim_engine_core::EngineError`'s provider split: a caller can
/// retry `Transient`, but `Permanent` (bad key, 4xx quota) should not be
/// retried.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return ProviderError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => ProviderError::Transient(err.to_string()),
            Some(status) if status.as_u16() == 429 => ProviderError::Transient(err.to_string()),
            _ => ProviderError::Permanent(err.to_string()),
        }
    }
}
