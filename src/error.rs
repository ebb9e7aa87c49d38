use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input rejected at ingestion. Never coerced.
    #[error("validation error: {0}")]
    Validation(String),

    /// Too few samples for a stable statistic. Callers fall back to a documented default.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("computation failure: {0}")]
    ComputationFailure(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Ranks out of total order or an illegal cycle transition. Indicates a logic bug.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Transient failures are safe to retry wholesale.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ComputationFailure(_) | EngineError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_computation_failures_are_transient() {
        assert!(EngineError::ComputationFailure("timeout".into()).is_transient());
        assert!(EngineError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!EngineError::Validation("score 120".into()).is_transient());
        assert!(!EngineError::ConsistencyViolation("rank 2 twice".into()).is_transient());
        assert!(!EngineError::InsufficientData("2 opportunities".into()).is_transient());
    }
}
