//! Relay Core
//!
//! A single actor task owns the producer link, the consumer queue and the one
//! active generation. Every input (consumer submissions, producer frames,
//! binds and disconnects) arrives as a [`Command`] on one channel, so events
//! are applied strictly in arrival order and a disconnect can never interleave
//! with a half-applied fragment. The only scheduled work is one timer, re-armed
//! after each command to the active detector's next deadline.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::relay::accumulator::MessageAccumulator;
use crate::relay::detector::{CompletionDetector, CompletionReason, CompletionStrategy, GenerationState, TimerOutcome};
use crate::relay::link::{LinkId, ProducerBinding, ProducerLink};
use crate::relay::multiplexer::{Completion, ConsumerResponse, ConsumerSink, ResponseMode};
use crate::relay::protocol::{parse_producer_frame, ProducerEvent, RelayMessage};
use crate::relay::queue::{ConsumerQueue, ConsumerRequest};

#[derive(Debug)]
enum Command {
    Submit {
        request: ConsumerRequest,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    BindProducer {
        reply: oneshot::Sender<ProducerBinding>,
    },
    ProducerFrame {
        link: LinkId,
        frame: String,
    },
    UnbindProducer {
        link: LinkId,
    },
    ResetSession {
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Status {
        reply: oneshot::Sender<RelayStatus>,
    },
}

/// Point-in-time view of the relay, for health checks and tests.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayStatus {
    pub producer_ready: bool,
    pub producer_connected_secs: Option<u64>,
    /// Requests waiting, including the active one
    pub queued: usize,
    pub active_generation: Option<String>,
    pub generation_state: Option<GenerationState>,
}

#[derive(Debug)]
struct Generation {
    id: String,
    consumer_id: String,
    started_at: Instant,
    accumulator: MessageAccumulator,
    detector: CompletionDetector,
}

#[derive(Debug, Clone)]
struct CoreSettings {
    strategy: CompletionStrategy,
    debounce: Duration,
    max_generation: Duration,
    reset_each_request: bool,
}

impl From<&RelayConfig> for CoreSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            strategy: config.strategy,
            debounce: config.debounce,
            max_generation: config.max_generation,
            reset_each_request: config.reset_each_request,
        }
    }
}

pub struct RelayCore {
    settings: CoreSettings,
    link: ProducerLink,
    queue: ConsumerQueue,
    active: Option<Generation>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl RelayCore {
    /// Start the actor on the current runtime.
    pub fn spawn(config: &RelayConfig) -> RelayHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let core = RelayCore {
            settings: CoreSettings::from(config),
            link: ProducerLink::new(),
            queue: ConsumerQueue::new(),
            active: None,
            commands,
        };
        tokio::spawn(core.run());
        RelayHandle { tx }
    }

    async fn run(mut self) {
        info!(
            "🛰️  Relay core running (strategy: {}, debounce: {:?}, max generation: {:?})",
            self.settings.strategy, self.settings.debounce, self.settings.max_generation
        );

        let timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timer);
        let mut armed: Option<Instant> = None;

        loop {
            // Queued commands first: a fragment that is already waiting must
            // be applied before a due timer is evaluated.
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command, Instant::now()),
                    None => break,
                },
                _ = &mut timer, if armed.is_some() => {
                    armed = None;
                    self.on_timer(Instant::now());
                }
            }

            let deadline = self.next_deadline();
            if deadline != armed {
                if let Some(deadline) = deadline {
                    timer.as_mut().reset(deadline);
                }
                armed = deadline;
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, command: Command, now: Instant) {
        match command {
            Command::Submit { request, reply } => {
                let _ = reply.send(self.submit(request, now));
            }
            Command::BindProducer { reply } => {
                let binding = self.bind_producer(now);
                let _ = reply.send(binding);
            }
            Command::ProducerFrame { link, frame } => self.producer_frame(link, &frame, now),
            Command::UnbindProducer { link } => self.unbind_producer(link, now),
            Command::ResetSession { reply } => {
                let _ = reply.send(self.reset_session());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status(now));
            }
        }
    }

    fn submit(&mut self, request: ConsumerRequest, now: Instant) -> RelayResult<()> {
        if !self.link.is_ready() {
            warn!(consumer = %request.id, "Rejecting request: {}", RelayError::ProducerUnavailable);
            return Err(RelayError::ProducerUnavailable);
        }

        info!(consumer = %request.id, mode = ?request.mode, ahead = self.queue.len(), "📥 Consumer request queued");
        self.queue.enqueue(request);
        self.pump(now);
        Ok(())
    }

    /// Start the head request if nothing is running. Heads that cannot start
    /// are released so the queue never stalls behind them.
    fn pump(&mut self, now: Instant) {
        while self.active.is_none() {
            let (consumer_id, prompt, gone, waited) = match self.queue.peek_head() {
                Some(head) => (
                    head.id.clone(),
                    head.prompt.clone(),
                    head.sink.is_closed(),
                    now.saturating_duration_since(head.enqueued_at),
                ),
                None => break,
            };

            if gone {
                self.queue.dequeue_head();
                info!(consumer = %consumer_id, "Consumer left after waiting {:?}; skipping", waited);
                continue;
            }

            let generation_id = Uuid::new_v4().to_string();
            if let Err(err) = self.issue_start(&prompt, &generation_id) {
                if let Some(mut head) = self.queue.dequeue_head() {
                    warn!(consumer = %consumer_id, "Cannot start generation: {}", err);
                    head.sink.fail(err);
                }
                continue;
            }

            info!(consumer = %consumer_id, generation = %generation_id, "🚀 Generation started after {:?} in queue", waited);
            self.active = Some(Generation {
                id: generation_id,
                consumer_id,
                started_at: now,
                accumulator: MessageAccumulator::new(),
                detector: CompletionDetector::new(
                    self.settings.strategy,
                    self.settings.debounce,
                    self.settings.max_generation,
                    now,
                ),
            });
        }
    }

    fn issue_start(&mut self, prompt: &str, generation_id: &str) -> RelayResult<()> {
        if !self.link.is_ready() {
            return Err(RelayError::ProducerUnavailable);
        }
        if self.settings.reset_each_request {
            self.link.send(RelayMessage::ResetSession)?;
        }
        self.link.send(RelayMessage::start(prompt, generation_id))
    }

    fn bind_producer(&mut self, now: Instant) -> ProducerBinding {
        let (binding, replaced) = self.link.bind();
        info!(link = binding.link, "🔌 Producer connected");

        if let Some(old) = replaced {
            warn!(link = old, "Producer link replaced; treating the old endpoint as disconnected");
            self.fail_active(CompletionReason::ProducerDisconnected, now);
        }
        self.pump(now);
        binding
    }

    fn unbind_producer(&mut self, link: LinkId, now: Instant) {
        if !self.link.unbind(link) {
            debug!(link = link, "Ignoring disconnect from a stale producer link");
            return;
        }
        warn!(link = link, "🔌 Producer disconnected");
        self.fail_active(CompletionReason::ProducerDisconnected, now);
        self.pump(now);
    }

    fn producer_frame(&mut self, link: LinkId, frame: &str, now: Instant) {
        if !self.link.is_current(link) {
            warn!(link = link, "Dropping frame from a stale producer link");
            return;
        }

        let event = match parse_producer_frame(frame) {
            Ok(event) => event,
            Err(err) => {
                warn!(link = link, "⚠️  {}", err);
                return;
            }
        };

        match event {
            ProducerEvent::Hello(note) => info!(link = link, "👋 Producer handshake: {}", note),
            ProducerEvent::Fragment { text, generation } => self.on_fragment(&text, generation.as_deref(), now),
            ProducerEvent::Complete { text, generation } => self.on_complete(text.as_deref(), generation.as_deref(), now),
        }
    }

    fn on_fragment(&mut self, text: &str, tag: Option<&str>, now: Instant) {
        let Some(generation) = active_for(&mut self.active, tag) else { return };
        if !generation.detector.on_fragment(now) {
            return;
        }

        generation.accumulator.apply_fragment(text);
        debug!(
            generation = %generation.id,
            chars = generation.accumulator.text().len(),
            updates = generation.accumulator.updates(),
            "Fragment applied"
        );
        if let Some(head) = self.queue.head_mut() {
            head.sink.push_snapshot(generation.accumulator.text());
        }
    }

    fn on_complete(&mut self, text: Option<&str>, tag: Option<&str>, now: Instant) {
        let Some(generation) = active_for(&mut self.active, tag) else { return };
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            generation.accumulator.apply_fragment(text);
        }
        if let Some(reason) = generation.detector.on_explicit_complete() {
            self.finish(reason, now);
        }
    }

    fn on_timer(&mut self, now: Instant) {
        let Some(generation) = self.active.as_mut() else { return };
        match generation.detector.on_timer(now) {
            TimerOutcome::Completed(reason) => self.finish(reason, now),
            TimerOutcome::Pending(deadline) => {
                debug!(generation = %generation.id, "Stale timer; next check in {:?}", deadline.saturating_duration_since(now));
            }
            TimerOutcome::Idle => {}
        }
    }

    fn fail_active(&mut self, reason: CompletionReason, now: Instant) {
        let Some(generation) = self.active.as_mut() else { return };
        if generation.detector.force_complete(reason).is_some() {
            self.finish(reason, now);
        }
    }

    /// Deliver the completed generation to the head consumer, dequeue it and
    /// start the next one.
    fn finish(&mut self, reason: CompletionReason, now: Instant) {
        let Some(generation) = self.active.take() else { return };
        let elapsed = now.saturating_duration_since(generation.started_at);
        let updates = generation.accumulator.updates();

        let completion = Completion {
            generation_id: generation.id,
            text: generation.accumulator.into_text(),
            reason,
        };

        if reason.is_truncated() {
            warn!(
                generation = %completion.generation_id,
                consumer = %generation.consumer_id,
                "⚠️  Generation ended early ({}) after {:?}, {} chars",
                reason, elapsed, completion.text.chars().count()
            );
        } else {
            info!(
                generation = %completion.generation_id,
                consumer = %generation.consumer_id,
                "✅ Generation complete ({}) after {:?}, {} updates",
                reason, elapsed, updates
            );
        }

        match self.queue.dequeue_head() {
            Some(mut head) => {
                if head.sink.is_closed() {
                    debug!(consumer = %head.id, "Consumer already gone; result discarded");
                }
                head.sink.finish(completion);
            }
            None => warn!("{}", RelayError::NoWaitingConsumer),
        }

        self.pump(now);
    }

    fn reset_session(&mut self) -> RelayResult<()> {
        if !self.link.is_ready() {
            return Err(RelayError::ProducerUnavailable);
        }
        if self.active.is_some() {
            return Err(RelayError::GenerationInProgress);
        }
        info!("🧹 Resetting producer session");
        self.link.send(RelayMessage::ResetSession)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|generation| generation.detector.next_deadline())
    }

    fn status(&self, now: Instant) -> RelayStatus {
        RelayStatus {
            producer_ready: self.link.is_ready(),
            producer_connected_secs: self.link.bound_at().map(|at| now.saturating_duration_since(at).as_secs()),
            queued: self.queue.len(),
            active_generation: self.active.as_ref().map(|generation| generation.id.clone()),
            generation_state: self.active.as_ref().map(|generation| generation.detector.state()),
        }
    }

    fn shutdown(&mut self) {
        self.active = None;
        for mut request in self.queue.drain() {
            request.sink.fail(RelayError::RelayStopped);
        }
        info!("Relay core stopped");
    }
}

/// The active generation, if `tag` (when present) names it.
fn active_for<'a>(active: &'a mut Option<Generation>, tag: Option<&str>) -> Option<&'a mut Generation> {
    let Some(generation) = active.as_mut() else {
        warn!("{}", RelayError::NoWaitingConsumer);
        return None;
    };
    match tag {
        Some(tag) if tag != generation.id => {
            warn!(expected = %generation.id, got = tag, "Dropping event for a different generation");
            None
        }
        _ => Some(generation),
    }
}

/// Cloneable entry point to the relay core.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RelayHandle {
    /// Queue a consumer request. Fails immediately with
    /// `ProducerUnavailable` when no producer is bound.
    pub async fn submit(&self, prompt: impl Into<String>, mode: ResponseMode) -> RelayResult<ConsumerResponse> {
        let (request, response) = match mode {
            ResponseMode::Streaming => {
                let (sink, chunks) = ConsumerSink::streaming();
                let request = ConsumerRequest::new(prompt, sink);
                let id = request.id.clone();
                (request, ConsumerResponse::Streaming { id, chunks })
            }
            ResponseMode::Aggregate => {
                let (sink, reply) = ConsumerSink::aggregate();
                let request = ConsumerRequest::new(prompt, sink);
                let id = request.id.clone();
                (request, ConsumerResponse::Aggregate { id, reply })
            }
        };

        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { request, reply })?;
        rx.await.map_err(|_| RelayError::RelayStopped)??;
        Ok(response)
    }

    /// Register a new producer endpoint, replacing any current one.
    pub async fn bind_producer(&self) -> RelayResult<ProducerBinding> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BindProducer { reply })?;
        rx.await.map_err(|_| RelayError::RelayStopped)
    }

    /// Hand a raw producer frame to the core. Validation happens there.
    pub fn producer_frame(&self, link: LinkId, frame: impl Into<String>) -> RelayResult<()> {
        self.send(Command::ProducerFrame { link, frame: frame.into() })
    }

    pub fn unbind_producer(&self, link: LinkId) -> RelayResult<()> {
        self.send(Command::UnbindProducer { link })
    }

    pub async fn reset_session(&self) -> RelayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ResetSession { reply })?;
        rx.await.map_err(|_| RelayError::RelayStopped)?
    }

    pub async fn status(&self) -> RelayResult<RelayStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| RelayError::RelayStopped)
    }

    fn send(&self, command: Command) -> RelayResult<()> {
        self.tx.send(command).map_err(|_| RelayError::RelayStopped)
    }
}
