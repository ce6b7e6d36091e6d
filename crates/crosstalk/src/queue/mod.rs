//! Per-conversation ordered queues.
//!
//! One queue per conversation id, created lazily on the first message and
//! garbage-collected after an idle timeout. Within a conversation, items are
//! handed to the processor strictly in sequence-number order; across
//! conversations everything runs concurrently.
//!
//! Out-of-order arrivals are held until the missing sequence number shows up
//! or the reorder timeout expires (a connector may burn a sequence number on
//! an event it then drops as malformed, and one lost message must not stall
//! the conversation forever).
//!
//! Each queue is bounded: past `max_depth` the oldest non-critical item is
//! dropped and a backpressure signal is emitted toward the originating
//! connector.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crosstalk_connector_protocol::Message;

use crate::agent::ChunkSender;
use crate::config::QueueConfig;

// ============================================================================
// Items
// ============================================================================

/// One admitted unit of work: a routed inbound message plus everything the
/// orchestrator needs to act on it.
pub struct QueueItem {
    pub message: Message,
    pub session_id: String,
    /// Agent configuration profile selected by the routing rule.
    pub profile: String,
    /// Critical items (API-originated, with a waiting client) are never
    /// dropped by overflow handling.
    pub critical: bool,
    /// Where incremental run output goes, for API-originated items.
    pub chunks: Option<ChunkSender>,
    pub cancel: CancellationToken,
}

/// What happened to an item at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Queued in order for the conversation worker.
    Enqueued,
    /// Injected into the session's live run as its next input.
    Steered,
    /// Out of order; held until the missing sequence number arrives.
    Held,
    /// Sequence number already delivered; dropped.
    Stale,
}

/// Emitted when a conversation queue overflows.
#[derive(Debug, Clone)]
pub struct BackpressureSignal {
    pub channel_id: String,
    pub conversation_id: String,
}

/// Consumes admitted items. Implemented by the gateway's orchestrator wiring.
#[async_trait]
pub trait ItemProcessor: Send + Sync + 'static {
    /// Try to inject the item into the session's live run. Returns the item
    /// back when the session has no live run (or the run just finished).
    async fn try_steer(&self, item: QueueItem) -> Option<QueueItem>;

    /// Process one in-order item to completion.
    async fn process(&self, item: QueueItem);
}

// ============================================================================
// Conversation state
// ============================================================================

struct ConvState {
    /// Next sequence number owed to the processor.
    next_seq: u64,
    /// In-order items awaiting the worker.
    ready: VecDeque<QueueItem>,
    /// Out-of-order items keyed by sequence number.
    held: BTreeMap<u64, QueueItem>,
    /// The worker is currently inside `process()`.
    processing: bool,
    /// Set when `held` is non-empty while `ready` is drained; drives the
    /// reorder timeout.
    gap_since: Option<Instant>,
    last_activity: Instant,
    closed: bool,
}

impl ConvState {
    fn depth(&self) -> usize {
        self.ready.len() + self.held.len()
    }

    /// Move every now-in-order held item into `ready`.
    fn promote(&mut self) {
        while let Some(item) = self.held.remove(&self.next_seq) {
            self.next_seq += 1;
            self.ready.push_back(item);
        }
        self.gap_since = if self.ready.is_empty() && !self.held.is_empty() {
            self.gap_since.or_else(|| Some(Instant::now()))
        } else {
            None
        };
    }

    /// Give up on a missing sequence number and resume from the lowest held.
    fn skip_gap(&mut self) {
        if let Some((&lowest, _)) = self.held.iter().next() {
            warn!(
                expected = self.next_seq,
                resuming_from = lowest,
                "Reorder timeout expired, skipping missing sequence numbers"
            );
            self.next_seq = lowest;
            self.promote();
        }
    }
}

struct ConversationQueue {
    state: Mutex<ConvState>,
    wake: Notify,
}

impl ConversationQueue {
    /// Lock the state, recovering from a panicked holder.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConvState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// QueueManager
// ============================================================================

#[derive(Clone)]
pub struct QueueManager {
    queues: Arc<DashMap<String, Arc<ConversationQueue>>>,
    processor: Arc<dyn ItemProcessor>,
    cfg: QueueConfig,
    backpressure: mpsc::Sender<BackpressureSignal>,
}

impl QueueManager {
    pub fn new(
        processor: Arc<dyn ItemProcessor>,
        cfg: QueueConfig,
        backpressure: mpsc::Sender<BackpressureSignal>,
    ) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            processor,
            cfg,
            backpressure,
        }
    }

    /// Admit a routed message.
    ///
    /// `expected_first_seq` seeds the order tracking when this call creates
    /// the conversation's queue (the router derives it from session history,
    /// so a conversation resumed after queue GC picks up where it left off).
    pub async fn admit(&self, mut item: QueueItem, expected_first_seq: u64) -> AdmitOutcome {
        let conversation_id = item.message.conversation_id.clone();
        let channel_id = item.message.channel_id.clone();

        loop {
            let queue = self.queue_for(&conversation_id, expected_first_seq);

            let (outcome, to_steer, overflowed) = {
                let mut state = queue.lock_state();
                // Collected between the lookup and the lock. The collector
                // only closes a queue it has already removed from the map,
                // so the next lookup creates a fresh one.
                if state.closed {
                    continue;
                }
                state.last_activity = Instant::now();

                let seq = item.message.seq;
                if seq < state.next_seq {
                    debug!(conversation = %conversation_id, seq, "Stale sequence number, dropping");
                    return AdmitOutcome::Stale;
                }
                if state.held.contains_key(&seq) {
                    debug!(conversation = %conversation_id, seq, "Duplicate sequence number, dropping");
                    return AdmitOutcome::Stale;
                }

                state.held.insert(seq, item);
                state.promote();

                // Steering only applies when the worker is mid-run and nothing
                // else is waiting in front; otherwise order would invert.
                let can_steer = state.processing && state.ready.len() == 1;
                let to_steer = if can_steer { state.ready.pop_front() } else { None };

                let overflowed = self.enforce_depth(&mut state, &conversation_id);

                let outcome = if to_steer.is_some() {
                    AdmitOutcome::Steered
                } else if state.held.contains_key(&seq) {
                    AdmitOutcome::Held
                } else {
                    AdmitOutcome::Enqueued
                };
                (outcome, to_steer, overflowed)
            };

            if overflowed {
                let _ = self
                    .backpressure
                    .send(BackpressureSignal {
                        channel_id: channel_id.clone(),
                        conversation_id: conversation_id.clone(),
                    })
                    .await;
            }

            if let Some(steer_item) = to_steer {
                if let Some(returned) = self.processor.try_steer(steer_item).await {
                    // The run ended between the check and the send; queue it.
                    let mut state = queue.lock_state();
                    if state.closed {
                        drop(state);
                        item = returned;
                        continue;
                    }
                    state.ready.push_front(returned);
                    queue.wake.notify_one();
                    return AdmitOutcome::Enqueued;
                }
                return AdmitOutcome::Steered;
            }

            queue.wake.notify_one();
            return outcome;
        }
    }

    /// Number of live conversation queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Spawn the periodic idle-queue collector. Returns its handle.
    pub fn spawn_gc(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let idle = Duration::from_secs(manager.cfg.idle_timeout_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle / 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.collect_idle(idle);
            }
        })
    }

    fn collect_idle(&self, idle: Duration) {
        let mut candidates = Vec::new();
        for entry in self.queues.iter() {
            let state = entry.value().lock_state();
            if !state.processing
                && state.ready.is_empty()
                && state.held.is_empty()
                && state.last_activity.elapsed() >= idle
            {
                candidates.push(entry.key().clone());
            }
        }
        for conversation_id in candidates {
            // Re-verify under the state lock while the map entry is held, so
            // an admit that slipped in since the scan keeps its queue. The
            // map entry is gone before `closed` is observable; admit relies
            // on that to create a replacement.
            let removed = self.queues.remove_if(&conversation_id, |_, queue| {
                let mut state = queue.lock_state();
                let still_idle = !state.processing
                    && state.ready.is_empty()
                    && state.held.is_empty()
                    && state.last_activity.elapsed() >= idle;
                if still_idle {
                    state.closed = true;
                    queue.wake.notify_one();
                }
                still_idle
            });
            if removed.is_some() {
                debug!(conversation = %conversation_id, "Collected idle conversation queue");
            }
        }
    }

    fn queue_for(&self, conversation_id: &str, expected_first_seq: u64) -> Arc<ConversationQueue> {
        if let Some(queue) = self.queues.get(conversation_id) {
            return queue.clone();
        }
        let queue = Arc::new(ConversationQueue {
            state: Mutex::new(ConvState {
                next_seq: expected_first_seq,
                ready: VecDeque::new(),
                held: BTreeMap::new(),
                processing: false,
                gap_since: None,
                last_activity: Instant::now(),
                closed: false,
            }),
            wake: Notify::new(),
        });
        let entry = self
            .queues
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!(conversation = %conversation_id, "Created conversation queue");
                let worker_queue = queue.clone();
                let processor = self.processor.clone();
                let reorder = Duration::from_millis(self.cfg.reorder_timeout_ms);
                tokio::spawn(run_worker(worker_queue, processor, reorder));
                queue
            });
        entry.clone()
    }

    /// Drop the oldest non-critical item when the queue is over depth.
    /// Returns whether anything was dropped.
    fn enforce_depth(&self, state: &mut ConvState, conversation_id: &str) -> bool {
        if state.depth() <= self.cfg.max_depth {
            return false;
        }
        // Oldest first: the front of the in-order queue, then the lowest
        // held sequence number.
        let oldest = state.ready.iter().position(|i| !i.critical);
        if let Some(dropped) = oldest.and_then(|pos| state.ready.remove(pos)) {
            warn!(
                conversation = %conversation_id,
                seq = dropped.message.seq,
                depth = state.depth(),
                "Queue over depth, dropped oldest message"
            );
            return true;
        }
        if let Some(seq) = state
            .held
            .iter()
            .find(|(_, i)| !i.critical)
            .map(|(&seq, _)| seq)
        {
            state.held.remove(&seq);
            warn!(
                conversation = %conversation_id,
                seq,
                depth = state.depth(),
                "Queue over depth, dropped held message"
            );
            return true;
        }
        // Everything pending is critical; keep it all.
        false
    }
}

// ============================================================================
// Worker
// ============================================================================

enum Next {
    Item(QueueItem),
    Wait,
    Exit,
}

async fn run_worker(
    queue: Arc<ConversationQueue>,
    processor: Arc<dyn ItemProcessor>,
    reorder_timeout: Duration,
) {
    loop {
        let next = {
            let mut state = queue.lock_state();
            if state.closed {
                Next::Exit
            } else {
                if state.ready.is_empty() {
                    if let Some(since) = state.gap_since {
                        if since.elapsed() >= reorder_timeout {
                            state.skip_gap();
                        }
                    }
                }
                match state.ready.pop_front() {
                    Some(item) => {
                        state.processing = true;
                        Next::Item(item)
                    }
                    None => {
                        state.processing = false;
                        Next::Wait
                    }
                }
            }
        };

        match next {
            Next::Item(item) => {
                processor.process(item).await;
                let mut state = queue.lock_state();
                state.processing = false;
                state.last_activity = Instant::now();
            }
            Next::Wait => {
                tokio::select! {
                    _ = queue.wake.notified() => {}
                    _ = tokio::time::sleep(reorder_timeout) => {}
                }
            }
            Next::Exit => return,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
