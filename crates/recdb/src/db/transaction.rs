//! Transactions - the single mutation scope of a recording database.
//!
//! At most one transaction is open per database. Opening one takes the
//! database write lock; [`RecDatabase::end_transaction`] publishes its effects
//! as one new Globalrev and releases the lock. Dropping an open transaction
//! (or calling [`Transaction::abort`]) publishes nothing and releases the lock.
//!
//! [`RecDatabase::end_transaction`]: crate::RecDatabase::end_transaction

use crate::channel::Channel;
use crate::db::DbShared;
use crate::error::{RecDbError, Result};
use crate::recording::Recording;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exclusive writer lock, tracking which transaction holds it.
#[derive(Debug, Default)]
pub(crate) struct WriteLock {
    holder: Mutex<Option<u64>>,
    released: Condvar,
}

impl WriteLock {
    fn lock(&self) -> MutexGuard<'_, Option<u64>> {
        self.holder.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Blocks until the lock is free, then takes it for `txn_id`.
    pub(crate) fn acquire(&self, txn_id: u64) {
        let mut holder = self.lock();
        while holder.is_some() {
            holder = self
                .released
                .wait(holder)
                .unwrap_or_else(|err| err.into_inner());
        }
        *holder = Some(txn_id);
    }

    /// Takes the lock for `txn_id` if it is free.
    pub(crate) fn try_acquire(&self, txn_id: u64) -> Result<()> {
        let mut holder = self.lock();
        match *holder {
            Some(current) => Err(RecDbError::Busy { holder: current }),
            None => {
                *holder = Some(txn_id);
                Ok(())
            }
        }
    }

    /// Waits up to `timeout` for the lock.
    pub(crate) fn acquire_timeout(&self, txn_id: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut holder = self.lock();
        while let Some(current) = *holder {
            let now = Instant::now();
            if now >= deadline {
                return Err(RecDbError::Busy { holder: current });
            }
            let (next, _) = self
                .released
                .wait_timeout(holder, deadline - now)
                .unwrap_or_else(|err| err.into_inner());
            holder = next;
        }
        *holder = Some(txn_id);
        Ok(())
    }

    /// Releases the lock if `txn_id` holds it.
    pub(crate) fn release(&self, txn_id: u64) {
        let mut holder = self.lock();
        if *holder == Some(txn_id) {
            *holder = None;
            drop(holder);
            self.released.notify_one();
        }
    }

    /// Identifier of the transaction holding the lock.
    pub(crate) fn holder(&self) -> Option<u64> {
        *self.lock()
    }
}

/// An open mutation scope.
///
/// Channel definitions and new recordings made through the transaction become
/// visible together when it is passed to
/// [`RecDatabase::end_transaction`](crate::RecDatabase::end_transaction).
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: u64,
    pub(crate) globalrev: u64,
    pub(crate) shared: Arc<DbShared>,
    pub(crate) new_channels: BTreeMap<String, Arc<Channel>>,
    pub(crate) recordings: BTreeMap<String, Arc<Recording>>,
    started_at: Instant,
    pub(crate) finished: bool,
}

impl Transaction {
    pub(crate) fn new(id: u64, globalrev: u64, shared: Arc<DbShared>) -> Self {
        debug!("Transaction {} opened for globalrev {}", id, globalrev);
        Self {
            id,
            globalrev,
            shared,
            new_channels: BTreeMap::new(),
            recordings: BTreeMap::new(),
            started_at: Instant::now(),
            finished: false,
        }
    }

    /// Transaction identifier, unique within its database.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of the Globalrev this transaction publishes when ended.
    pub fn globalrev(&self) -> u64 {
        self.globalrev
    }

    /// Time since the transaction was opened.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Number of channels defined in this transaction.
    pub fn defined_channel_count(&self) -> usize {
        self.new_channels.len()
    }

    /// Number of recordings created in this transaction.
    pub fn recording_count(&self) -> usize {
        self.recordings.len()
    }

    /// Returns true if nothing was defined or created yet.
    pub fn is_empty(&self) -> bool {
        self.new_channels.is_empty() && self.recordings.is_empty()
    }

    /// Discards the transaction without publishing anything.
    pub fn abort(mut self) {
        self.finish_aborted();
        debug!("Transaction {} aborted", self.id);
    }

    fn finish_aborted(&mut self) {
        self.finished = true;
        self.shared.writer.release(self.id);
        self.shared
            .stats
            .transactions_aborted
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.finish_aborted();
            warn!(
                "Transaction {} dropped without end_transaction; \
                 {} channel definitions and {} recordings discarded",
                self.id,
                self.new_channels.len(),
                self.recordings.len()
            );
        }
    }
}
