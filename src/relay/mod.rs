//! Relay Module
//!
//! Bridges one producer connection to a FIFO of consumers: completion
//! detection, delta streaming and queueing, all owned by a single actor.

pub mod accumulator;
pub mod actor;
pub mod detector;
pub mod link;
pub mod multiplexer;
pub mod protocol;
pub mod queue;

pub use actor::{RelayCore, RelayHandle, RelayStatus};
pub use accumulator::MessageAccumulator;
pub use detector::{CompletionDetector, CompletionReason, CompletionStrategy, GenerationState, TimerOutcome};
pub use link::{LinkId, ProducerBinding};
pub use multiplexer::{AggregateReply, Completion, ConsumerResponse, DeltaTracker, ResponseMode, StreamItem};
pub use protocol::{ProducerEvent, RelayMessage, WireDialect};
pub use queue::{ConsumerQueue, ConsumerRequest};
