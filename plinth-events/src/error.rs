use thiserror::Error;

/// Errors surfaced by the event bus and broker layer.
#[derive(Debug, Error)]
pub enum EventError {
    /// The subscription options are invalid (missing or duplicate worker
    /// group). The subscription is rejected; nothing was registered.
    #[error("invalid subscription: {0}")]
    InvalidConfig(String),

    /// The broker connection is gone. Fatal for emitting and subscribing.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The bus has been shut down; no further emits or subscribes succeed.
    #[error("event bus is shut down")]
    ShutDown,

    /// A hook payload failed to serialize or deserialize.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
