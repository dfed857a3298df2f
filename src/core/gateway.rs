//! Subscriber-facing event streams.
//!
//! Opening a stream attaches to the run's broadcast channel first and only
//! then replays the log, so nothing appended in between can be missed. Live
//! events already seen in the replay are dropped by sequence number, and a
//! jump in sequence numbers is filled from the log.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use tracing::{debug, warn};
use uuid::Uuid;

use super::broadcast::Subscription;
use super::event_log::EventLog;
use super::registry::RunRegistry;
use super::run_store::RunStore;
use crate::domain::Event;
use crate::error::{EngineError, Result};

/// Opens event streams for live and archived runs
#[derive(Clone)]
pub struct StreamGateway {
    registry: Arc<RunRegistry>,
    store: RunStore,
    log: Arc<dyn EventLog>,
}

impl StreamGateway {
    pub fn new(registry: Arc<RunRegistry>, store: RunStore, log: Arc<dyn EventLog>) -> Self {
        Self {
            registry,
            store,
            log,
        }
    }

    /// Stream a run's events with `seq >= from_seq` (0 means from the start)
    pub async fn open(&self, run_id: Uuid, from_seq: u64) -> Result<EventStream> {
        let live = match self.registry.get(run_id) {
            // None here means the run already terminated: replay only
            Some(handle) => handle.channel().attach(),
            None => {
                if self.store.get_run(run_id).await?.is_none() {
                    return Err(EngineError::RunNotFound(run_id));
                }
                None
            }
        };

        let next_seq = from_seq.max(1);
        let pending: VecDeque<Event> = self.log.read_range(run_id, next_seq).await?.into();

        debug!(
            %run_id,
            from_seq = next_seq,
            replayed = pending.len(),
            live = live.is_some(),
            "Stream opened"
        );

        Ok(EventStream {
            run_id,
            log: self.log.clone(),
            pending,
            live,
            next_seq,
            done: false,
        })
    }
}

/// Replay followed by live tail for one subscriber.
///
/// Ends after the terminal event. Dropping it detaches from the run.
pub struct EventStream {
    run_id: Uuid,
    log: Arc<dyn EventLog>,
    pending: VecDeque<Event>,
    live: Option<Subscription>,
    next_seq: u64,
    done: bool,
}

impl EventStream {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Sequence number of the last delivered event (0 if none yet)
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Next event in sequence order; `None` once the stream has ended.
    ///
    /// Yields `SubscriberLagged` (and then ends) if the live feed was evicted
    /// for falling behind; reopen from the reported sequence to continue.
    pub async fn next(&mut self) -> Option<Result<Event>> {
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.pending.pop_front() {
                if event.seq < self.next_seq {
                    continue;
                }
                return Some(Ok(self.deliver(event)));
            }

            let Some(live) = self.live.as_mut() else {
                // Replay exhausted and nothing live to wait on
                self.done = true;
                return None;
            };

            match live.recv().await {
                Some(event) if event.seq < self.next_seq => continue,
                Some(event) if event.seq == self.next_seq => {
                    return Some(Ok(self.deliver(event)));
                }
                Some(event) => {
                    debug!(
                        run_id = %self.run_id,
                        expected = self.next_seq,
                        got = event.seq,
                        "Gap in live feed, filling from log"
                    );
                    if let Err(e) = self.catch_up().await {
                        return Some(Err(e));
                    }
                }
                None => {
                    let evicted = live.was_evicted();
                    self.live = None;

                    if evicted {
                        warn!(
                            run_id = %self.run_id,
                            next_seq = self.next_seq,
                            "Subscriber lagged behind live feed"
                        );
                        self.done = true;
                        return Some(Err(EngineError::SubscriberLagged {
                            run_id: self.run_id,
                            next_seq: self.next_seq,
                        }));
                    }

                    // Channel closed with the run: whatever remains is in the log
                    if let Err(e) = self.catch_up().await {
                        return Some(Err(e));
                    }
                }
            }
        }
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> + Send {
        stream::unfold(self, |mut events| async move {
            let item = events.next().await?;
            Some((item, events))
        })
    }

    async fn catch_up(&mut self) -> Result<()> {
        match self.log.read_range(self.run_id, self.next_seq).await {
            Ok(events) => {
                self.pending.extend(events);
                Ok(())
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    fn deliver(&mut self, event: Event) -> Event {
        self.next_seq = event.seq + 1;
        if event.is_terminal() {
            self.done = true;
            self.live = None;
        }
        event
    }
}
