use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] consumer_common::ValidationError),

    #[error("broker error: {0}")]
    Broker(#[from] consumer_broker::BrokerError),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue already consumed: {0}")]
    AlreadyConsumed(String),

    #[error("queue not consumed: {0}")]
    NotConsumed(String),

    #[error("queue already paused: {0}")]
    AlreadyPaused(String),

    #[error("queue not paused: {0}")]
    NotPaused(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn is_reconnect_worthy(&self) -> bool {
        matches!(self, EngineError::Broker(e) if e.triggers_reconnection())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::AlreadyConsumed(_) | EngineError::AlreadyPaused(_) | EngineError::NotPaused(_) => 400,
            EngineError::QueueNotFound(_) | EngineError::NotConsumed(_) => 404,
            EngineError::Broker(_) | EngineError::Persistence(_) | EngineError::ShuttingDown => 503,
        }
    }
}
