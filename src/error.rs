//! Relay Error Kinds
//!
//! Every failure the relay core can surface to a consumer or log on behalf of
//! the producer.

use thiserror::Error;

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// No producer link is bound, so no generation can be started.
    #[error("Producer not ready: no source observer is connected")]
    ProducerUnavailable,

    /// The producer link dropped while a generation was in flight.
    #[error("Producer disconnected mid-generation ({} chars received)", partial.chars().count())]
    ProducerDisconnected { partial: String },

    /// An event arrived while no consumer was waiting for it.
    #[error("No waiting consumer for producer event")]
    NoWaitingConsumer,

    /// A producer frame failed schema validation.
    #[error("Malformed producer event: {0}")]
    MalformedEvent(String),

    /// The consumer request itself is unusable.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The operation needs an idle producer.
    #[error("A generation is already in progress")]
    GenerationInProgress,

    /// The relay core task has shut down.
    #[error("Relay core stopped")]
    RelayStopped,
}

impl RelayError {
    /// Partial text carried by a truncated failure, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            RelayError::ProducerDisconnected { partial } => Some(partial),
            _ => None,
        }
    }
}
