//! Stream Multiplexer
//!
//! Turns the producer's full-text snapshots into what a consumer expects:
//! incremental deltas over an open channel, or one aggregated reply.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::RelayError;
use crate::relay::detector::CompletionReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Streaming,
    Aggregate,
}

/// Tracks what one consumer has already been sent and yields the next delta.
///
/// When a snapshot extends the emitted text, the delta is the new suffix.
/// When it does not (the producer rewrote earlier text), the whole snapshot is
/// re-sent as a single delta.
#[derive(Debug, Clone, Default)]
pub struct DeltaTracker {
    emitted: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delta(&mut self, snapshot: &str) -> Option<String> {
        if let Some(suffix) = snapshot.strip_prefix(self.emitted.as_str()) {
            if suffix.is_empty() {
                return None;
            }
            self.emitted.push_str(suffix);
            return Some(suffix.to_string());
        }

        self.emitted.clear();
        self.emitted.push_str(snapshot);
        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot.to_string())
        }
    }

    pub fn emitted(&self) -> &str {
        &self.emitted
    }
}

/// Items delivered to a streaming consumer, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Delta(String),
    /// Terminal: the generation ended for this reason.
    Finished(CompletionReason),
    /// Terminal: the request never started.
    Failed(RelayError),
}

/// Final result of a generation as seen by its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub generation_id: String,
    pub text: String,
    pub reason: CompletionReason,
}

pub type AggregateReply = Result<Completion, RelayError>;

/// The response channel owned by one consumer request.
#[derive(Debug)]
pub enum ConsumerSink {
    Streaming {
        tx: mpsc::UnboundedSender<StreamItem>,
        tracker: DeltaTracker,
        closed: bool,
    },
    Aggregate {
        tx: Option<oneshot::Sender<AggregateReply>>,
    },
}

impl ConsumerSink {
    pub fn streaming() -> (Self, mpsc::UnboundedReceiver<StreamItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConsumerSink::Streaming { tx, tracker: DeltaTracker::new(), closed: false }, rx)
    }

    pub fn aggregate() -> (Self, oneshot::Receiver<AggregateReply>) {
        let (tx, rx) = oneshot::channel();
        (ConsumerSink::Aggregate { tx: Some(tx) }, rx)
    }

    pub fn mode(&self) -> ResponseMode {
        match self {
            ConsumerSink::Streaming { .. } => ResponseMode::Streaming,
            ConsumerSink::Aggregate { .. } => ResponseMode::Aggregate,
        }
    }

    /// The consumer hung up, or has already received its terminal item.
    pub fn is_closed(&self) -> bool {
        match self {
            ConsumerSink::Streaming { tx, closed, .. } => *closed || tx.is_closed(),
            ConsumerSink::Aggregate { tx } => tx.as_ref().map_or(true, |tx| tx.is_closed()),
        }
    }

    /// Forward the latest snapshot. Aggregate sinks buffer nothing here; the
    /// final text comes with [`finish`](Self::finish).
    pub fn push_snapshot(&mut self, snapshot: &str) {
        if let ConsumerSink::Streaming { tx, tracker, closed } = self {
            if *closed {
                return;
            }
            if let Some(delta) = tracker.next_delta(snapshot) {
                if tx.send(StreamItem::Delta(delta)).is_err() {
                    debug!("Streaming consumer went away; dropping further deltas");
                    *closed = true;
                }
            }
        }
    }

    pub fn finish(&mut self, completion: Completion) {
        match self {
            ConsumerSink::Streaming { .. } => {
                self.push_snapshot(&completion.text);
                self.send_terminal(StreamItem::Finished(completion.reason));
            }
            ConsumerSink::Aggregate { tx } => {
                let reply = if completion.reason == CompletionReason::ProducerDisconnected {
                    Err(RelayError::ProducerDisconnected { partial: completion.text })
                } else {
                    Ok(completion)
                };
                if let Some(tx) = tx.take() {
                    let _ = tx.send(reply);
                }
            }
        }
    }

    pub fn fail(&mut self, error: RelayError) {
        match self {
            ConsumerSink::Streaming { .. } => self.send_terminal(StreamItem::Failed(error)),
            ConsumerSink::Aggregate { tx } => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(error));
                }
            }
        }
    }

    fn send_terminal(&mut self, item: StreamItem) {
        if let ConsumerSink::Streaming { tx, closed, .. } = self {
            if !*closed {
                let _ = tx.send(item);
                *closed = true;
            }
        }
    }
}

/// What a consumer holds while its request is queued or running.
#[derive(Debug)]
pub enum ConsumerResponse {
    Streaming {
        id: String,
        chunks: mpsc::UnboundedReceiver<StreamItem>,
    },
    Aggregate {
        id: String,
        reply: oneshot::Receiver<AggregateReply>,
    },
}

impl ConsumerResponse {
    pub fn id(&self) -> &str {
        match self {
            ConsumerResponse::Streaming { id, .. } | ConsumerResponse::Aggregate { id, .. } => id,
        }
    }
}
