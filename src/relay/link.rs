//! Producer Link
//!
//! At most one producer endpoint is bound. Each binding gets a fresh id so
//! that frames and disconnects from a replaced connection can be recognised
//! and ignored.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{RelayError, RelayResult};
use crate::relay::protocol::RelayMessage;

pub type LinkId = u64;

/// Handed to the transport that owns the producer connection.
#[derive(Debug)]
pub struct ProducerBinding {
    pub link: LinkId,
    /// Messages to forward to the producer, in order.
    pub outbound: mpsc::UnboundedReceiver<RelayMessage>,
}

#[derive(Debug)]
struct BoundLink {
    id: LinkId,
    tx: mpsc::UnboundedSender<RelayMessage>,
    bound_at: Instant,
}

#[derive(Debug, Default)]
pub struct ProducerLink {
    current: Option<BoundLink>,
    next_id: LinkId,
}

impl ProducerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready means bound and the transport is still reading our channel.
    pub fn is_ready(&self) -> bool {
        self.current.as_ref().is_some_and(|link| !link.tx.is_closed())
    }

    pub fn current_id(&self) -> Option<LinkId> {
        self.current.as_ref().map(|link| link.id)
    }

    pub fn is_current(&self, id: LinkId) -> bool {
        self.current_id() == Some(id)
    }

    pub fn bound_at(&self) -> Option<Instant> {
        self.current.as_ref().map(|link| link.bound_at)
    }

    /// Bind a new endpoint. Returns the id of the endpoint it replaced, if any.
    pub fn bind(&mut self) -> (ProducerBinding, Option<LinkId>) {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, outbound) = mpsc::unbounded_channel();
        let replaced = self.current.replace(BoundLink { id, tx, bound_at: Instant::now() }).map(|old| old.id);
        (ProducerBinding { link: id, outbound }, replaced)
    }

    /// Returns `true` if `id` was the bound endpoint.
    pub fn unbind(&mut self, id: LinkId) -> bool {
        if self.is_current(id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Send towards the producer. A closed channel means the transport is
    /// gone; the link is dropped and the caller sees `ProducerUnavailable`.
    pub fn send(&mut self, message: RelayMessage) -> RelayResult<()> {
        let link = self.current.as_ref().ok_or(RelayError::ProducerUnavailable)?;
        if link.tx.send(message).is_err() {
            self.current = None;
            return Err(RelayError::ProducerUnavailable);
        }
        Ok(())
    }
}
