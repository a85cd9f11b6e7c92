//! Consumer Queue
//!
//! Strict FIFO of requests waiting on the single producer. The head is the
//! request bound to the current generation, if one is running.

use std::collections::VecDeque;
use tokio::time::Instant;
use uuid::Uuid;

use crate::relay::multiplexer::{ConsumerSink, ResponseMode};

#[derive(Debug)]
pub struct ConsumerRequest {
    pub id: String,
    pub mode: ResponseMode,
    pub prompt: String,
    pub enqueued_at: Instant,
    pub sink: ConsumerSink,
}

impl ConsumerRequest {
    pub fn new(prompt: impl Into<String>, sink: ConsumerSink) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            mode: sink.mode(),
            prompt: prompt.into(),
            enqueued_at: Instant::now(),
            sink,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsumerQueue {
    entries: VecDeque<ConsumerRequest>,
}

impl ConsumerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: ConsumerRequest) {
        self.entries.push_back(request);
    }

    pub fn peek_head(&self) -> Option<&ConsumerRequest> {
        self.entries.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut ConsumerRequest> {
        self.entries.front_mut()
    }

    pub fn dequeue_head(&mut self) -> Option<ConsumerRequest> {
        self.entries.pop_front()
    }

    /// Remove everything, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = ConsumerRequest> + '_ {
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
