//! Request/response correlation
//!
//! A request is tagged with a fresh correlation id and a [`Slot`] is parked
//! in the [`PendingTable`] under that id. The connection's read loop calls
//! [`Correlator::complete`] for every inbound frame; a frame whose id has a
//! slot fills it and is not dispatched to handlers.
//!
//! Two waiting styles are offered:
//! - [`Correlator::request_blocking`] parks the calling thread until the
//!   slot fills or the request timeout elapses. Never call it from a task
//!   that drives connection I/O.
//! - [`Correlator::request`] returns a [`ResponseFuture`] that resolves on
//!   arrival or at a fixed deadline, whichever comes first. The deadline is
//!   set when the request is issued and a late response does not move it.

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::network::Transmitter;
use crate::protocol::Frame;

/// Default ceiling for blocking requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default deadline for future-based requests
pub const DEFAULT_RESPONSE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SlotState {
    Waiting,
    Filled(Frame),
    /// Deadline passed or the value was taken; later arrivals are ignored
    Closed,
}

/// One-shot result cell for an outstanding request
#[derive(Debug)]
pub struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
    notify: Notify,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Store a response. Only the first call while waiting succeeds.
    pub fn fill(&self, frame: Frame) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*state, SlotState::Waiting) {
            return false;
        }
        *state = SlotState::Filled(frame);
        drop(state);

        self.ready.notify_all();
        self.notify.notify_one();
        true
    }

    /// Take the response if there is one and close the slot either way
    fn take(&self) -> Option<Frame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, SlotState::Closed) {
            SlotState::Filled(frame) => Some(frame),
            SlotState::Waiting | SlotState::Closed => None,
        }
    }

    fn wait_blocking(&self, timeout: Duration) -> Option<Frame> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| matches!(state, SlotState::Waiting))
            .unwrap_or_else(|e| e.into_inner());
        drop(state);
        self.take()
    }

    async fn wait(&self, deadline: Duration) -> Option<Frame> {
        // A fill before this point leaves a permit, so nothing is missed
        let _ = tokio::time::timeout(deadline, self.notify.notified()).await;
        self.take()
    }
}

/// Concurrent map of outstanding correlation ids.
///
/// Finished ids linger as tombstones until their expiry so that a late or
/// duplicate response is still recognised as correlated.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    slots: Arc<DashMap<Uuid, Arc<Slot>>>,
    retired: Arc<DashMap<Uuid, Instant>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a fresh slot under `id`
    pub fn register(&self, id: Uuid) -> Arc<Slot> {
        let slot = Arc::new(Slot::new());
        self.retired.remove(&id);
        if self.slots.insert(id, slot.clone()).is_some() {
            tracing::warn!("Correlation id {} was already pending; replaced", id);
        }
        slot
    }

    /// True while `id` is outstanding or its tombstone has not expired
    pub fn contains(&self, id: &Uuid) -> bool {
        self.slots.contains_key(id) || self.is_retired(id)
    }

    pub fn is_retired(&self, id: &Uuid) -> bool {
        self.retired
            .get(id)
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Slot>> {
        self.slots.get(id).map(|slot| slot.value().clone())
    }

    /// Forget `id` entirely, leaving no tombstone
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Slot>> {
        self.slots.remove(id).map(|(_, slot)| slot)
    }

    /// Stop waiting on `id` but keep recognising it for `linger`
    pub fn retire(&self, id: Uuid, linger: Duration) {
        let now = Instant::now();
        self.retired.retain(|_, expiry| *expiry > now);
        self.slots.remove(&id);
        self.retired.insert(id, now + linger);
    }

    /// Number of requests still waiting; tombstones are not counted
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Resolves to the correlated response, or `None` once the deadline passed
pub struct ResponseFuture {
    rx: oneshot::Receiver<Option<Frame>>,
}

impl Future for ResponseFuture {
    type Output = Option<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.ok().flatten())
    }
}

/// Matches outgoing requests to inbound responses
#[derive(Debug)]
pub struct Correlator {
    pending: PendingTable,
    request_timeout: Duration,
    response_deadline: Duration,
}

impl Correlator {
    pub fn new(pending: PendingTable, request_timeout: Duration, response_deadline: Duration) -> Self {
        Self {
            pending,
            request_timeout,
            response_deadline,
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Send `frame` as a request and park this thread until the response
    /// arrives or the request timeout elapses.
    pub fn request_blocking(&self, transmitter: &Transmitter, frame: Frame) -> Option<Frame> {
        let id = Uuid::new_v4();
        let slot = self.pending.register(id);

        if !transmitter.send_serial(frame.with_correlation(id)) {
            self.pending.remove(&id);
            return None;
        }

        let response = slot.wait_blocking(self.request_timeout);
        self.pending.retire(id, self.response_deadline);

        if response.is_none() {
            tracing::debug!("Request {} timed out after {:?}", id, self.request_timeout);
        }
        response
    }

    /// Send `frame` as a request; the returned future resolves with the
    /// response, or with `None` at the response deadline.
    pub fn request(&self, transmitter: &Transmitter, frame: Frame) -> ResponseFuture {
        let id = Uuid::new_v4();
        let slot = self.pending.register(id);
        let (tx, rx) = oneshot::channel();

        if !transmitter.send_pooled(frame.with_correlation(id)) {
            self.pending.remove(&id);
            let _ = tx.send(None);
            return ResponseFuture { rx };
        }

        let pending = self.pending.clone();
        let deadline = self.response_deadline;
        transmitter.runtime().spawn(async move {
            let response = slot.wait(deadline).await;
            pending.retire(id, deadline);
            if response.is_none() {
                tracing::debug!("Request {} expired after {:?}", id, deadline);
            }
            let _ = tx.send(response);
        });

        ResponseFuture { rx }
    }

    /// Route an inbound frame to its waiting request.
    ///
    /// Returns true when the frame answered a pending request, in which case
    /// it must not be dispatched to handlers. Only the first answer is kept;
    /// answers to finished requests are swallowed until their tombstone expires.
    pub fn complete(&self, frame: &Frame) -> bool {
        let Some(id) = frame.correlation_id else {
            return false;
        };
        let Some(slot) = self.pending.get(&id) else {
            if self.pending.is_retired(&id) {
                tracing::debug!("Ignored late response for request {}", id);
                return true;
            }
            return false;
        };

        if !slot.fill(frame.clone()) {
            tracing::debug!("Ignored duplicate response for request {}", id);
        }
        true
    }
}
