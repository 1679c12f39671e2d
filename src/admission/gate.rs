//! Per-destination admission gate
//!
//! At most `max_active` transfers run against one upstream URL at a time.
//! Further callers wait in a strict FIFO queue with a deadline; releasing a
//! slot hands it straight to the oldest waiter that is still listening, so
//! a queued caller is never overtaken by a newcomer.

use crate::config::AdmissionSettings;
use crate::proxy::types::ProxyError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {0:?} waiting for an admission slot")]
pub struct QueueTimeout(pub Duration);

impl From<QueueTimeout> for ProxyError {
    fn from(timeout: QueueTimeout) -> Self {
        ProxyError::QueueTimeout(timeout.0)
    }
}

struct Waiter {
    id: u64,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct SlotState {
    active: usize,
    waiters: VecDeque<Waiter>,
}

impl SlotState {
    fn is_idle(&self) -> bool {
        self.active == 0 && self.waiters.is_empty()
    }
}

struct GateInner {
    slots: Mutex<HashMap<String, SlotState>>,
    max_active: usize,
    queue_timeout: Duration,
    next_waiter_id: AtomicU64,
}

impl GateInner {
    fn release(&self, url: &str) {
        let mut slots = self.slots.lock();
        let Some(state) = slots.get_mut(url) else {
            warn!(url, "Release for a URL with no admission state");
            return;
        };

        // Hand the slot over; waiters whose receiver is gone are skipped
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.notify.send(()).is_ok() {
                debug!(url, waiter = waiter.id, "Admission slot handed to queued caller");
                return;
            }
        }

        state.active = state.active.saturating_sub(1);
        if state.is_idle() {
            slots.remove(url);
        }
    }

    /// Remove a still-queued waiter; `false` means it was already dequeued
    fn withdraw(&self, url: &str, id: u64) -> bool {
        let mut slots = self.slots.lock();
        let Some(state) = slots.get_mut(url) else {
            return false;
        };
        let before = state.waiters.len();
        state.waiters.retain(|waiter| waiter.id != id);
        let withdrawn = state.waiters.len() != before;
        if state.is_idle() {
            slots.remove(url);
        }
        withdrawn
    }
}

/// Cloneable handle to the shared gate state
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    pub fn new(max_active: usize, queue_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                slots: Mutex::new(HashMap::new()),
                max_active: max_active.max(1),
                queue_timeout,
                next_waiter_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_settings(settings: &AdmissionSettings) -> Self {
        Self::new(
            settings.max_active_per_url,
            Duration::from_secs(settings.queue_timeout_secs),
        )
    }

    fn permit(&self, url: &str) -> AdmissionPermit {
        AdmissionPermit {
            gate: Arc::clone(&self.inner),
            url: url.to_string(),
        }
    }

    /// Take a slot if one is free and nobody is queued ahead
    pub fn try_enter(&self, url: &str) -> Option<AdmissionPermit> {
        let mut slots = self.inner.slots.lock();
        let state = slots.entry(url.to_string()).or_default();
        if state.active < self.inner.max_active && state.waiters.is_empty() {
            state.active += 1;
            drop(slots);
            return Some(self.permit(url));
        }
        None
    }

    /// Take a slot, queueing behind earlier callers until the deadline
    pub async fn enter(&self, url: &str) -> Result<AdmissionPermit, QueueTimeout> {
        let (id, receiver) = {
            let mut slots = self.inner.slots.lock();
            let state = slots.entry(url.to_string()).or_default();
            if state.active < self.inner.max_active && state.waiters.is_empty() {
                state.active += 1;
                drop(slots);
                return Ok(self.permit(url));
            }

            let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (notify, receiver) = oneshot::channel();
            state.waiters.push_back(Waiter { id, notify });
            debug!(url, waiter = id, queued = state.waiters.len(), "Queued for admission");
            (id, receiver)
        };

        let mut pending = PendingAdmission {
            gate: Arc::clone(&self.inner),
            url: url.to_string(),
            id,
            receiver: Some(receiver),
        };

        let timeout = self.inner.queue_timeout;
        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(true) => {
                pending.receiver = None;
                Ok(self.permit(url))
            }
            Ok(false) => Err(QueueTimeout(timeout)),
            Err(_) => {
                if pending.take_after_deadline() {
                    Ok(self.permit(url))
                } else {
                    debug!(url, waiter = id, "Admission queue deadline passed");
                    Err(QueueTimeout(timeout))
                }
            }
        }
    }

    /// Transfers currently holding a slot for `url`
    pub fn active(&self, url: &str) -> usize {
        self.inner
            .slots
            .lock()
            .get(url)
            .map_or(0, |state| state.active)
    }

    /// Callers currently queued for `url`
    pub fn queued(&self, url: &str) -> usize {
        self.inner
            .slots
            .lock()
            .get(url)
            .map_or(0, |state| state.waiters.len())
    }

    pub fn tracked_urls(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Drop abandoned waiters and idle entries, returning how many entries went away
    pub fn prune(&self) -> usize {
        let mut slots = self.inner.slots.lock();
        let before = slots.len();
        slots.retain(|_, state| {
            state.waiters.retain(|waiter| !waiter.notify.is_closed());
            !state.is_idle()
        });
        before - slots.len()
    }
}

/// Queue membership of one `enter` call
///
/// Dropping it before the slot is claimed (deadline, or the caller going
/// away) withdraws from the queue, or returns a slot that was handed over
/// in the meantime.
struct PendingAdmission {
    gate: Arc<GateInner>,
    url: String,
    id: u64,
    receiver: Option<oneshot::Receiver<()>>,
}

impl PendingAdmission {
    async fn wait(&mut self) -> bool {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.await.is_ok(),
            None => false,
        }
    }

    /// After the deadline: withdraw, unless a handoff raced the timer
    fn take_after_deadline(&mut self) -> bool {
        if self.gate.withdraw(&self.url, self.id) {
            self.receiver = None;
            return false;
        }
        match self.receiver.take() {
            Some(mut receiver) => receiver.try_recv().is_ok(),
            None => false,
        }
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        if self.gate.withdraw(&self.url, self.id) {
            return;
        }
        if receiver.try_recv().is_ok() {
            self.gate.release(&self.url);
        }
    }
}

/// A held admission slot, released on drop
pub struct AdmissionPermit {
    gate: Arc<GateInner>,
    url: String,
}

impl AdmissionPermit {
    /// Give the slot back now, promoting the next queued caller
    pub fn release(self) {
        debug!(url = %self.url, "Releasing admission slot");
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release(&self.url);
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("url", &self.url)
            .finish()
    }
}
