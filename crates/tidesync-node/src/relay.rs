//! Bounded inter-stage relay
//!
//! A relay sits between two pipeline stages. The producing stage pushes
//! batches tagged with a swimlane id; the consuming stage pulls them in order.
//! The capacity is small on purpose: it keeps a fast source from running ahead
//! of a slow downstream, it is not meant to absorb volume.
//!
//! ```text
//! SelectStage ──push──▶ [ b1 | b2 | b3 ] ──pull_by_order──▶ ExtractStage
//!                        capacity = 3
//! ```
//!
//! `push` waits while the relay is full and gives the batch back if its
//! cancellation token fires, so a batch is either fully queued or still owned
//! by the caller. `pull` never waits.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tidesync_common::{SwimlaneId, SwimlanePolicy};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Push failure; the rejected item is handed back to the caller
#[derive(Debug, Error)]
pub enum RelayError<T> {
    #[error("push cancelled while relay was full")]
    Cancelled(T),

    #[error("push timed out while relay was full")]
    Timeout(T),
}

impl<T> RelayError<T> {
    /// Recover the item that was not queued
    pub fn into_inner(self) -> T {
        match self {
            RelayError::Cancelled(item) | RelayError::Timeout(item) => item,
        }
    }
}

/// Pending entries, ordered by policy
enum Lanes<T> {
    Fifo(VecDeque<(SwimlaneId, T)>),
    RoundRobin {
        queues: HashMap<SwimlaneId, VecDeque<T>>,
        rotation: VecDeque<SwimlaneId>,
    },
}

impl<T> Lanes<T> {
    fn new(policy: SwimlanePolicy) -> Self {
        match policy {
            SwimlanePolicy::Fifo => Lanes::Fifo(VecDeque::new()),
            SwimlanePolicy::RoundRobin => Lanes::RoundRobin {
                queues: HashMap::new(),
                rotation: VecDeque::new(),
            },
        }
    }

    fn push(&mut self, lane: SwimlaneId, item: T) {
        match self {
            Lanes::Fifo(queue) => queue.push_back((lane, item)),
            Lanes::RoundRobin { queues, rotation } => {
                let queue = queues.entry(lane.clone()).or_default();
                if queue.is_empty() {
                    rotation.push_back(lane);
                }
                queue.push_back(item);
            }
        }
    }

    fn pop(&mut self) -> Option<(SwimlaneId, T)> {
        match self {
            Lanes::Fifo(queue) => queue.pop_front(),
            Lanes::RoundRobin { queues, rotation } => {
                let lane = rotation.pop_front()?;
                let queue = queues.get_mut(&lane)?;
                let item = queue.pop_front()?;
                if queue.is_empty() {
                    queues.remove(&lane);
                } else {
                    rotation.push_back(lane.clone());
                }
                Some((lane, item))
            }
        }
    }
}

struct RelayState<T> {
    lanes: Lanes<T>,
    len: usize,
}

/// Fixed-capacity, multi-producer, single-drain queue of batches
pub struct BoundedRelay<T> {
    name: String,
    capacity: usize,
    fill_hint: usize,
    state: Mutex<RelayState<T>>,
    /// Signalled after every pull
    space: Notify,
    pushed: AtomicU64,
    pulled: AtomicU64,
}

impl<T> BoundedRelay<T> {
    /// Create a relay holding at most `capacity` entries
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        fill_hint: usize,
        policy: SwimlanePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            fill_hint,
            state: Mutex::new(RelayState {
                lanes: Lanes::new(policy),
                len: 0,
            }),
            space: Notify::new(),
            pushed: AtomicU64::new(0),
            pulled: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Expected elements per entry (informational)
    pub fn fill_hint(&self) -> usize {
        self.fill_hint
    }

    /// Pending entries
    pub fn size(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total entries accepted since creation
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total entries handed out since creation
    pub fn pulled(&self) -> u64 {
        self.pulled.load(Ordering::Relaxed)
    }

    /// Queue the item if there is room, otherwise hand it back
    pub fn try_push(&self, lane: SwimlaneId, item: T) -> std::result::Result<(), T> {
        let mut state = self.state.lock();
        if state.len >= self.capacity {
            return Err(item);
        }
        state.lanes.push(lane, item);
        state.len += 1;
        let depth = state.len;
        drop(state);

        self.pushed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tidesync_relay_pushed_total", "relay" => self.name.clone()).increment(1);
        metrics::gauge!("tidesync_relay_depth", "relay" => self.name.clone()).set(depth as f64);
        Ok(())
    }

    /// Queue an item, waiting while the relay is full
    ///
    /// Returns [`RelayError::Cancelled`] with the item if `cancel` fires
    /// before room frees up.
    pub async fn push(
        &self,
        lane: SwimlaneId,
        item: T,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), RelayError<T>> {
        self.push_until(lane, item, cancel.cancelled(), RelayError::Cancelled)
            .await
    }

    /// Queue an item, waiting at most `timeout` for room
    pub async fn push_timeout(
        &self,
        lane: SwimlaneId,
        item: T,
        timeout: Duration,
    ) -> std::result::Result<(), RelayError<T>> {
        self.push_until(lane, item, tokio::time::sleep(timeout), RelayError::Timeout)
            .await
    }

    async fn push_until<F>(
        &self,
        lane: SwimlaneId,
        mut item: T,
        give_up: F,
        on_give_up: fn(T) -> RelayError<T>,
    ) -> std::result::Result<(), RelayError<T>>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(give_up);
        loop {
            // Register for wakeups before checking, so a pull between the
            // check and the wait is not missed.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(lane.clone(), item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected,
            }

            tokio::select! {
                biased;
                _ = &mut give_up => return Err(on_give_up(item)),
                _ = &mut notified => {}
            }
        }
    }

    /// Take the oldest entry, if any
    pub fn pull(&self) -> Option<(SwimlaneId, T)> {
        let mut state = self.state.lock();
        let entry = state.lanes.pop()?;
        state.len -= 1;
        let depth = state.len;
        drop(state);

        self.pulled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tidesync_relay_pulled_total", "relay" => self.name.clone()).increment(1);
        metrics::gauge!("tidesync_relay_depth", "relay" => self.name.clone()).set(depth as f64);
        self.space.notify_waiters();
        Some(entry)
    }

    /// Take the next entry honoring per-swimlane order
    ///
    /// Callers keep per-swimlane ordering downstream by pushing the result
    /// under the returned swimlane id.
    pub fn pull_by_order(&self) -> Option<(SwimlaneId, T)> {
        self.pull()
    }

    /// Wait until the relay is empty; false if `timeout` elapsed first
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Remove every pending entry, oldest first
    pub fn drain_remaining(&self) -> Vec<(SwimlaneId, T)> {
        let mut state = self.state.lock();
        let mut drained = Vec::with_capacity(state.len);
        while let Some(entry) = state.lanes.pop() {
            drained.push(entry);
        }
        state.len = 0;
        drop(state);

        self.pulled.fetch_add(drained.len() as u64, Ordering::Relaxed);
        metrics::counter!("tidesync_relay_pulled_total", "relay" => self.name.clone())
            .increment(drained.len() as u64);
        metrics::gauge!("tidesync_relay_depth", "relay" => self.name.clone()).set(0.0);
        self.space.notify_waiters();
        drained
    }

    /// Pull-only view handed to the consuming stage
    pub fn reader(self: &Arc<Self>) -> RelayReader<T> {
        RelayReader {
            relay: Arc::clone(self),
        }
    }
}

impl<T> std::fmt::Debug for BoundedRelay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedRelay")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish()
    }
}

/// Pull side of a relay, held by the downstream stage
pub struct RelayReader<T> {
    relay: Arc<BoundedRelay<T>>,
}

impl<T> Clone for RelayReader<T> {
    fn clone(&self) -> Self {
        Self {
            relay: Arc::clone(&self.relay),
        }
    }
}

impl<T> RelayReader<T> {
    pub fn pull_by_order(&self) -> Option<(SwimlaneId, T)> {
        self.relay.pull_by_order()
    }

    pub fn size(&self) -> usize {
        self.relay.size()
    }

    pub fn is_empty(&self) -> bool {
        self.relay.is_empty()
    }

    pub fn name(&self) -> &str {
        self.relay.name()
    }
}
