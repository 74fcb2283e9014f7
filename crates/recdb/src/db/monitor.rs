//! Revision monitors - blocking subscriptions to newly committed Globalrevs.
//!
//! Every commit is broadcast to every subscribed monitor. Each monitor keeps
//! its own queue, so `wait_next` returns revisions one at a time in commit
//! order rather than skipping to the newest.
//!
//! ```text
//! end_transaction ──► MonitorRegistry::broadcast ──┬─► slot 1 queue ─► wait_next
//!                                                 ├─► slot 2 queue ─► wait_next
//!                                                 └─► slot N queue ─► wait_next
//! ```
//!
//! Closing a monitor unsubscribes it and releases any thread blocked in
//! `wait_next` with [`RecDbError::Cancelled`]. Dropping a monitor closes it.

use crate::db::globalrev::Globalrev;
use crate::error::{RecDbError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of undelivered Globalrevs a monitor buffers.
pub const DEFAULT_MONITOR_QUEUE_LIMIT: usize = 256;

/// Configuration for a single revision monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Maximum number of undelivered Globalrevs.
    ///
    /// When exceeded the oldest undelivered revision is dropped.
    /// Default: 256.
    pub queue_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_MONITOR_QUEUE_LIMIT,
        }
    }
}

impl MonitorConfig {
    /// Sets the queue limit.
    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
}

#[derive(Debug)]
struct MonitorQueue {
    pending: VecDeque<Globalrev>,
    /// Highest Globalrev number ever queued or current at subscription.
    last_queued: u64,
    /// Highest Globalrev number handed to the consumer.
    last_seen: u64,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct MonitorSlot {
    id: u64,
    queue_limit: usize,
    queue: Mutex<MonitorQueue>,
    available: Condvar,
}

impl MonitorSlot {
    fn new(id: u64, start: u64, queue_limit: usize) -> Self {
        Self {
            id,
            queue_limit: queue_limit.max(1),
            queue: Mutex::new(MonitorQueue {
                pending: VecDeque::new(),
                last_queued: start,
                last_seen: start,
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorQueue> {
        self.queue.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn publish(&self, globalrev: &Globalrev) {
        let mut queue = self.lock();
        if queue.closed || globalrev.number() <= queue.last_queued {
            return;
        }
        queue.last_queued = globalrev.number();
        queue.pending.push_back(globalrev.clone());
        if queue.pending.len() > self.queue_limit {
            queue.pending.pop_front();
            queue.dropped += 1;
            warn!(
                "Monitor {} queue full; dropped oldest undelivered globalrev ({} dropped so far)",
                self.id, queue.dropped
            );
        }
        drop(queue);
        self.available.notify_all();
    }

    /// Marks the slot closed. Returns false if it was already closed.
    fn close(&self) -> bool {
        let mut queue = self.lock();
        if queue.closed {
            return false;
        }
        queue.closed = true;
        queue.pending.clear();
        drop(queue);
        self.available.notify_all();
        true
    }
}

/// Registry of live monitor subscriptions of one database.
#[derive(Debug, Default)]
pub(crate) struct MonitorRegistry {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, Arc<MonitorSlot>>>,
}

impl MonitorRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<MonitorSlot>>> {
        self.slots.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Registers a subscription starting after Globalrev `start`.
    ///
    /// Must be called while the database state is read-locked so no commit
    /// can slip between reading `start` and registering.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        start: u64,
        config: &MonitorConfig,
    ) -> RevisionMonitor {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = Arc::new(MonitorSlot::new(id, start, config.queue_limit));
        self.lock().insert(id, slot.clone());
        debug!("Monitor {} subscribed after globalrev {}", id, start);
        RevisionMonitor {
            slot,
            registry: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Delivers a new Globalrev to every subscribed monitor.
    pub(crate) fn broadcast(&self, globalrev: &Globalrev) {
        let slots: Vec<Arc<MonitorSlot>> = self.lock().values().cloned().collect();
        for slot in slots {
            slot.publish(globalrev);
        }
    }

    /// Number of live subscriptions.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A subscription to the Globalrevs committed after it was created.
///
/// The monitor is `Sync`: one thread may block in [`wait_next`] while another
/// calls [`close`] to cancel it.
///
/// [`wait_next`]: RevisionMonitor::wait_next
/// [`close`]: RevisionMonitor::close
#[derive(Debug)]
pub struct RevisionMonitor {
    slot: Arc<MonitorSlot>,
    registry: Arc<MonitorRegistry>,
}

impl RevisionMonitor {
    /// Subscription identifier, unique within its database.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Number of the last Globalrev returned by this monitor (or the current
    /// Globalrev at subscription time).
    pub fn last_seen(&self) -> u64 {
        self.slot.lock().last_seen
    }

    /// Number of Globalrevs queued but not yet returned.
    pub fn pending(&self) -> usize {
        self.slot.lock().pending.len()
    }

    /// Number of Globalrevs dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }

    /// Returns true once the monitor is closed.
    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    /// Blocks until the next Globalrev after the last one observed.
    ///
    /// The returned revision may still be incomplete; call
    /// [`Globalrev::wait_complete`] to wait for its recordings.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Cancelled` if the monitor is or becomes closed.
    pub fn wait_next(&self) -> Result<Globalrev> {
        let mut queue = self.slot.lock();
        loop {
            if queue.closed {
                return Err(RecDbError::Cancelled);
            }
            if let Some(globalrev) = queue.pending.pop_front() {
                queue.last_seen = globalrev.number();
                return Ok(globalrev);
            }
            queue = self
                .slot
                .available
                .wait(queue)
                .unwrap_or_else(|err| err.into_inner());
        }
    }

    /// Like [`wait_next`](Self::wait_next) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// `Cancelled` if closed, `Timeout` if no Globalrev arrives in time.
    pub fn wait_next_timeout(&self, timeout: Duration) -> Result<Globalrev> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.slot.lock();
        loop {
            if queue.closed {
                return Err(RecDbError::Cancelled);
            }
            if let Some(globalrev) = queue.pending.pop_front() {
                queue.last_seen = globalrev.number();
                return Ok(globalrev);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecDbError::Timeout(timeout));
            }
            let (next, _) = self
                .slot
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|err| err.into_inner());
            queue = next;
        }
    }

    /// Returns the next queued Globalrev without blocking.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Cancelled` if the monitor is closed.
    pub fn try_next(&self) -> Result<Option<Globalrev>> {
        let mut queue = self.slot.lock();
        if queue.closed {
            return Err(RecDbError::Cancelled);
        }
        let next = queue.pending.pop_front();
        if let Some(globalrev) = &next {
            queue.last_seen = globalrev.number();
        }
        Ok(next)
    }

    /// Unsubscribes and cancels any in-progress wait. Idempotent.
    pub fn close(&self) {
        if self.slot.close() {
            self.registry.unsubscribe(self.slot.id);
            debug!("Monitor {} closed", self.slot.id);
        }
    }
}

impl Drop for RevisionMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn revision(number: u64) -> Globalrev {
        let mut rev = Globalrev::initial();
        for n in 1..=number {
            rev = rev.successor(n, std::iter::empty::<&str>(), std::iter::empty());
        }
        rev
    }

    #[test]
    fn test_queue_delivers_in_order() {
        let registry = Arc::new(MonitorRegistry::default());
        let monitor = registry.subscribe(0, &MonitorConfig::default());
        registry.broadcast(&revision(1));
        registry.broadcast(&revision(2));

        assert_eq!(monitor.pending(), 2);
        assert_eq!(monitor.wait_next().unwrap().number(), 1);
        assert_eq!(monitor.wait_next().unwrap().number(), 2);
        assert_eq!(monitor.last_seen(), 2);
        assert!(monitor.try_next().unwrap().is_none());
    }

    #[test]
    fn test_revisions_at_or_before_start_are_skipped() {
        let registry = Arc::new(MonitorRegistry::default());
        let monitor = registry.subscribe(3, &MonitorConfig::default());
        registry.broadcast(&revision(3));
        assert_eq!(monitor.pending(), 0);
        registry.broadcast(&revision(4));
        assert_eq!(monitor.try_next().unwrap().unwrap().number(), 4);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let registry = Arc::new(MonitorRegistry::default());
        let monitor = registry.subscribe(0, &MonitorConfig::default().with_queue_limit(2));
        for n in 1..=3 {
            registry.broadcast(&revision(n));
        }
        assert_eq!(monitor.dropped(), 1);
        assert_eq!(monitor.wait_next().unwrap().number(), 2);
    }

    #[test]
    fn test_close_is_idempotent_and_unsubscribes() {
        let registry = Arc::new(MonitorRegistry::default());
        let monitor = registry.subscribe(0, &MonitorConfig::default());
        assert_eq!(registry.len(), 1);
        monitor.close();
        monitor.close();
        assert_eq!(registry.len(), 0);
        assert!(matches!(monitor.wait_next(), Err(RecDbError::Cancelled)));
        assert!(matches!(monitor.try_next(), Err(RecDbError::Cancelled)));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = Arc::new(MonitorRegistry::default());
        {
            let _monitor = registry.subscribe(0, &MonitorConfig::default());
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_close_cancels_blocked_wait() {
        let registry = Arc::new(MonitorRegistry::default());
        let monitor = registry.subscribe(0, &MonitorConfig::default());

        thread::scope(|scope| {
            let waiter = scope.spawn(|| monitor.wait_next());
            thread::sleep(Duration::from_millis(20));
            monitor.close();
            assert!(matches!(waiter.join().unwrap(), Err(RecDbError::Cancelled)));
        });
    }

    #[test]
    fn test_wait_next_timeout() {
        let registry = Arc::new(MonitorRegistry::default());
        let monitor = registry.subscribe(0, &MonitorConfig::default());
        assert!(matches!(
            monitor.wait_next_timeout(Duration::from_millis(10)),
            Err(RecDbError::Timeout(_))
        ));
    }
}
