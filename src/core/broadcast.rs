//! Per-run fan-out of appended events to live subscribers.
//!
//! Every subscriber owns a bounded buffer. Publishing never waits: a
//! subscriber whose buffer is full is evicted (its feed ends after the events
//! already buffered) and must resume from the event log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::Event;

struct Slot {
    id: u64,
    sender: mpsc::Sender<Event>,
    evicted: Arc<AtomicBool>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<Slot>,
    next_id: u64,
    closed: bool,
}

/// Fan-out channel for one run
pub struct BroadcastChannel {
    run_id: Uuid,
    buffer: usize,
    state: Mutex<ChannelState>,
}

impl BroadcastChannel {
    /// Create a channel giving each subscriber `buffer` events of slack
    pub fn new(run_id: Uuid, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            buffer: buffer.max(1),
            state: Mutex::new(ChannelState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // A panic while holding the lock cannot leave the subscriber list
        // half-updated, so recover the guard
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a new subscriber; `None` once the channel has been closed
    pub fn attach(self: &Arc<Self>) -> Option<Subscription> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        let evicted = Arc::new(AtomicBool::new(false));
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Slot {
            id,
            sender,
            evicted: evicted.clone(),
        });

        debug!(run_id = %self.run_id, subscriber = id, "Subscriber attached");

        Some(Subscription {
            id,
            run_id: self.run_id,
            receiver,
            evicted,
            channel: Arc::downgrade(self),
        })
    }

    /// Remove a subscriber; its feed ends after what it already buffered
    pub fn detach(&self, id: u64) {
        let mut state = self.lock();
        state.subscribers.retain(|slot| slot.id != id);
    }

    /// Deliver an event to every attached subscriber without blocking
    pub fn publish(&self, event: &Event) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        state.subscribers.retain(|slot| match slot.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    run_id = %self.run_id,
                    subscriber = slot.id,
                    seq = event.seq,
                    "Subscriber buffer full, evicting"
                );
                slot.evicted.store(true, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Stop accepting subscribers and end every live feed
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of currently attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// A live subscriber handle; detaches itself when dropped
pub struct Subscription {
    id: u64,
    run_id: Uuid,
    receiver: mpsc::Receiver<Event>,
    evicted: Arc<AtomicBool>,
    channel: Weak<BroadcastChannel>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next published event; `None` once the feed has ended
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Whether the channel dropped this subscriber for falling behind
    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.detach(self.id);
        }
    }
}
