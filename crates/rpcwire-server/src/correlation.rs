//! Matching responses to the callers waiting on them.
//!
//! Each outbound call registers its tag before the request is sent and then
//! waits on a [`PendingCall`] slot until the reader task completes it, the
//! connection closes, or the timeout elapses. Slots are pooled: releasing a
//! call wakes anything still parked on it, clears it and returns it to the
//! free list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{ServerError, ServerResult};

/// How a wait on a pending call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The response payload arrived.
    Completed(Bytes),
    /// The timeout elapsed first.
    TimedOut,
    /// The connection closed first.
    Closed,
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Ready(Bytes),
    Consumed,
    Closed,
}

/// A reusable wait slot for one outstanding call.
#[derive(Debug, Default)]
pub struct PendingCall {
    slot: Mutex<Slot>,
    signaled: AtomicBool,
    notify: Notify,
}

impl PendingCall {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `slot` if nothing has been stored yet and wakes the waiter.
    fn signal(&self, slot: Slot) -> bool {
        {
            let mut current = self.lock();
            if !matches!(*current, Slot::Empty) {
                return false;
            }
            *current = slot;
        }
        self.signaled.store(true, Ordering::Release);
        self.notify.notify_one();
        true
    }

    /// Wakes any waiter regardless of the slot's state.
    fn force_signal(&self) {
        self.signaled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn reset(&self) {
        *self.lock() = Slot::Empty;
        self.signaled.store(false, Ordering::Release);
    }

    /// True once a response or close has been delivered.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn take_outcome(&self) -> Option<WaitOutcome> {
        let mut slot = self.lock();
        match std::mem::take(&mut *slot) {
            Slot::Ready(data) => {
                *slot = Slot::Consumed;
                Some(WaitOutcome::Completed(data))
            }
            Slot::Closed => {
                *slot = Slot::Closed;
                Some(WaitOutcome::Closed)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Waits for a response. A zero `timeout` waits forever.
    ///
    /// Wakeups that leave the slot empty (stale permits from a previous use
    /// of this slot) are ignored.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.take_outcome() {
                return outcome;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.take_outcome().unwrap_or(WaitOutcome::TimedOut);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<i64, Arc<PendingCall>>,
    free: Vec<Arc<PendingCall>>,
    closed: bool,
}

/// Tag-keyed table of in-flight calls for one connection.
#[derive(Debug)]
pub struct CorrelationTable {
    table: Mutex<Table>,
    pool_capacity: usize,
}

impl CorrelationTable {
    /// Creates a table keeping at most `pool_capacity` idle slots.
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            pool_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a waiter for `tag`.
    ///
    /// Fails if the tag already has a waiter or the connection has closed.
    /// The registration lasts until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, tag: i64) -> ServerResult<PendingGuard> {
        let mut table = self.lock();
        if table.closed {
            return Err(ServerError::NotConnected);
        }
        if table.pending.contains_key(&tag) {
            return Err(ServerError::TagInUse { tag });
        }
        let call = table.free.pop().unwrap_or_default();
        call.reset();
        table.pending.insert(tag, call.clone());
        trace!(tag, in_flight = table.pending.len(), "Registered pending call");

        Ok(PendingGuard {
            table: self.clone(),
            tag,
            call,
        })
    }

    /// Delivers a response to the waiter on `tag`.
    ///
    /// Returns false when nobody is waiting, e.g. after a timeout.
    pub fn complete(&self, tag: i64, data: Bytes) -> bool {
        // Signal under the table lock so a concurrent release cannot
        // recycle the slot between lookup and store.
        let table = self.lock();
        match table.pending.get(&tag) {
            Some(call) => call.signal(Slot::Ready(data)),
            None => false,
        }
    }

    /// Fails every waiter and refuses new registrations.
    pub fn close(&self) {
        let mut table = self.lock();
        table.closed = true;
        for call in table.pending.values() {
            call.signal(Slot::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns true if `tag` has a waiter.
    pub fn contains(&self, tag: i64) -> bool {
        self.lock().pending.contains_key(&tag)
    }

    /// Number of registered calls.
    pub fn in_flight(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of idle slots ready for reuse.
    pub fn pooled(&self) -> usize {
        self.lock().free.len()
    }

    fn release(&self, tag: i64, call: &Arc<PendingCall>) {
        let mut table = self.lock();
        if table
            .pending
            .get(&tag)
            .is_some_and(|current| Arc::ptr_eq(current, call))
        {
            table.pending.remove(&tag);
        }
        call.force_signal();
        call.reset();
        if table.free.len() < self.pool_capacity {
            table.free.push(call.clone());
        }
        trace!(tag, in_flight = table.pending.len(), "Released pending call");
    }
}

/// Registration of one call; deregisters and recycles the slot on drop.
#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<CorrelationTable>,
    tag: i64,
    call: Arc<PendingCall>,
}

impl PendingGuard {
    pub fn tag(&self) -> i64 {
        self.tag
    }

    /// Waits for the response. A zero `timeout` waits forever.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        self.call.wait(timeout).await
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.release(self.tag, &self.call);
    }
}
