use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("channel not ready")]
    NotReady,

    #[error("broker client is shutting down")]
    ShuttingDown,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// True for errors the reconnection controller should react to.
    pub fn triggers_reconnection(&self) -> bool {
        match self {
            BrokerError::Connection(msg) | BrokerError::Channel(msg) => {
                crate::classify::is_reconnect_worthy(msg)
            }
            _ => false,
        }
    }
}
