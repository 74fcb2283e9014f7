//! The recording database - channel registry, transaction ordering and
//! Globalrev publication.
//!
//! # Commit path
//!
//! ```text
//! start_transaction ──► WriteLock (one writer) ──► Transaction
//!                                                   │ define_channel
//!                                                   │ create_recording
//!                                                   ▼
//! end_transaction: validate all ──► state.write() {
//!                                     register channels
//!                                     append recordings to histories
//!                                     latest = latest.successor(...)
//!                                     retain window, broadcast to monitors
//!                                   } ──► release WriteLock
//! ```
//!
//! Monitors subscribe under the state read lock and commits broadcast under
//! the state write lock, so a monitor never misses a Globalrev committed after
//! its subscription point.

pub mod globalrev;
pub mod monitor;
pub mod transaction;

use crate::channel::Channel;
use crate::error::{RecDbError, Result};
use crate::recording::Recording;
use crate::storage::ElementType;
use globalrev::Globalrev;
use monitor::{MonitorConfig, MonitorRegistry, RevisionMonitor, DEFAULT_MONITOR_QUEUE_LIMIT};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};
use transaction::{Transaction, WriteLock};

/// Default number of recordings retained per channel history.
pub const DEFAULT_HISTORY_DEPTH: usize = 16;

/// Default number of past Globalrevs retained for lookup by number.
pub const DEFAULT_GLOBALREV_RETENTION: usize = 32;

static NEXT_DB_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a recording database.
#[derive(Debug, Clone)]
pub struct RecDbConfig {
    /// Recordings retained in each channel history.
    /// Default: 16.
    pub history_depth: usize,
    /// Past Globalrevs retained for [`RecDatabase::globalrev`].
    /// Default: 32.
    pub globalrev_retention: usize,
    /// Queue limit of monitors opened with
    /// [`RecDatabase::start_monitoring_globalrevs`].
    /// Default: 256.
    pub monitor_queue_limit: usize,
}

impl Default for RecDbConfig {
    fn default() -> Self {
        Self {
            history_depth: DEFAULT_HISTORY_DEPTH,
            globalrev_retention: DEFAULT_GLOBALREV_RETENTION,
            monitor_queue_limit: DEFAULT_MONITOR_QUEUE_LIMIT,
        }
    }
}

impl RecDbConfig {
    /// Sets the per-channel history depth (at least 1 is kept).
    pub fn with_history_depth(mut self, history_depth: usize) -> Self {
        self.history_depth = history_depth;
        self
    }

    /// Sets how many past Globalrevs stay retrievable by number.
    pub fn with_globalrev_retention(mut self, globalrev_retention: usize) -> Self {
        self.globalrev_retention = globalrev_retention;
        self
    }

    /// Sets the default monitor queue limit.
    pub fn with_monitor_queue_limit(mut self, monitor_queue_limit: usize) -> Self {
        self.monitor_queue_limit = monitor_queue_limit;
        self
    }
}

/// Counters for a recording database.
#[derive(Debug, Default)]
pub struct RecDbStats {
    /// Transactions that published a Globalrev.
    pub transactions_committed: AtomicU64,
    /// Transactions aborted explicitly or by drop.
    pub transactions_aborted: AtomicU64,
    /// Recordings created inside transactions.
    pub recordings_created: AtomicU64,
    /// Recordings appended to channel histories by a commit.
    pub recordings_published: AtomicU64,
    /// Channels registered by a commit.
    pub channels_defined: AtomicU64,
}

impl RecDbStats {
    /// Gets the committed transaction count.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Gets the aborted transaction count.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Gets the created recording count.
    pub fn recordings_created(&self) -> u64 {
        self.recordings_created.load(Ordering::Relaxed)
    }

    /// Gets the published recording count.
    pub fn recordings_published(&self) -> u64 {
        self.recordings_published.load(Ordering::Relaxed)
    }

    /// Gets the registered channel count.
    pub fn channels_defined(&self) -> u64 {
        self.channels_defined.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct DbState {
    channels: BTreeMap<String, Arc<Channel>>,
    latest: Globalrev,
    /// Recent Globalrevs, oldest first, ending with `latest`.
    retained: VecDeque<Globalrev>,
}

#[derive(Debug)]
pub(crate) struct DbShared {
    id: u64,
    config: RecDbConfig,
    state: RwLock<DbState>,
    pub(crate) writer: WriteLock,
    monitors: Arc<MonitorRegistry>,
    pub(crate) stats: RecDbStats,
    next_txn_id: AtomicU64,
}

impl DbShared {
    fn read(&self) -> RwLockReadGuard<'_, DbState> {
        self.state.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DbState> {
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }
}

/// Handle to a transactional recording database.
///
/// Cloning is cheap; all clones share the same channels, revisions and
/// monitors. Independent databases never share state.
#[derive(Debug, Clone)]
pub struct RecDatabase {
    shared: Arc<DbShared>,
}

impl Default for RecDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl RecDatabase {
    /// Creates an empty database at Globalrev 0 with default configuration.
    pub fn new() -> Self {
        Self::with_config(RecDbConfig::default())
    }

    /// Creates an empty database with the given configuration.
    pub fn with_config(config: RecDbConfig) -> Self {
        let initial = Globalrev::initial();
        let id = NEXT_DB_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Recording database {} created", id);
        Self {
            shared: Arc::new(DbShared {
                id,
                config,
                state: RwLock::new(DbState {
                    channels: BTreeMap::new(),
                    latest: initial.clone(),
                    retained: VecDeque::from([initial]),
                }),
                writer: WriteLock::default(),
                monitors: Arc::new(MonitorRegistry::default()),
                stats: RecDbStats::default(),
                next_txn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Database configuration.
    pub fn config(&self) -> &RecDbConfig {
        &self.shared.config
    }

    /// Database counters.
    pub fn stats(&self) -> &RecDbStats {
        &self.shared.stats
    }

    /// Returns true if both handles refer to the same database.
    pub fn same_database(&self, other: &RecDatabase) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn next_txn_id(&self) -> u64 {
        self.shared.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn open_transaction(&self, id: u64) -> Transaction {
        let globalrev = self.shared.read().latest.number() + 1;
        Transaction::new(id, globalrev, self.shared.clone())
    }

    /// Opens the single write transaction, blocking while another is open.
    pub fn start_transaction(&self) -> Transaction {
        let id = self.next_txn_id();
        self.shared.writer.acquire(id);
        self.open_transaction(id)
    }

    /// Opens a transaction without blocking.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Busy` if another transaction is open.
    pub fn try_start_transaction(&self) -> Result<Transaction> {
        let id = self.next_txn_id();
        self.shared.writer.try_acquire(id)?;
        Ok(self.open_transaction(id))
    }

    /// Opens a transaction, waiting at most `timeout` for the write lock.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Busy` if the lock is still held after `timeout`.
    pub fn start_transaction_timeout(&self, timeout: Duration) -> Result<Transaction> {
        let id = self.next_txn_id();
        self.shared.writer.acquire_timeout(id, timeout)?;
        Ok(self.open_transaction(id))
    }

    fn check_owned(&self, txn: &Transaction) -> Result<()> {
        if !Arc::ptr_eq(&txn.shared, &self.shared) {
            return Err(RecDbError::InvalidState(format!(
                "transaction {} belongs to another database",
                txn.id
            )));
        }
        Ok(())
    }

    /// Defines a channel, or returns the existing one with the same owner.
    ///
    /// The channel becomes visible to readers when `txn` ends.
    ///
    /// # Errors
    ///
    /// - `InvalidState` for a foreign transaction or an empty name or one
    ///   containing whitespace
    /// - `Conflict` if the channel exists with a different owner
    pub fn define_channel(
        &self,
        txn: &mut Transaction,
        name: &str,
        owner: &str,
    ) -> Result<Arc<Channel>> {
        self.check_owned(txn)?;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RecDbError::InvalidState(format!(
                "invalid channel name '{name}'"
            )));
        }

        let existing = match txn.new_channels.get(name) {
            Some(channel) => Some(channel.clone()),
            None => self.shared.read().channels.get(name).cloned(),
        };
        if let Some(channel) = existing {
            if channel.owner() != owner {
                warn!(
                    "Channel {} owned by {} cannot be redefined by {}",
                    name,
                    channel.owner(),
                    owner
                );
                return Err(RecDbError::Conflict(format!(
                    "channel {name} is owned by {}",
                    channel.owner()
                )));
            }
            return Ok(channel);
        }

        let channel = Arc::new(Channel::new(self.shared.id, name, owner));
        txn.new_channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Creates a single-array recording (slot 0, named `"data"`).
    ///
    /// # Errors
    ///
    /// See [`create_multi_array_recording`](Self::create_multi_array_recording).
    pub fn create_recording(
        &self,
        txn: &mut Transaction,
        channel: &Channel,
        element_type: ElementType,
    ) -> Result<Arc<Recording>> {
        self.check_recording_target(txn, channel)?;
        let recording = Recording::new_single(
            channel.name(),
            channel.next_revision(),
            txn.globalrev,
            element_type,
        );
        Ok(self.stage_recording(txn, recording))
    }

    /// Creates a recording with `num_arrays` undefined slots.
    ///
    /// Slots are declared with [`Recording::define_array`].
    ///
    /// # Errors
    ///
    /// - `InvalidState` for a foreign transaction or channel
    /// - `ChannelNotFound` if the channel is neither registered nor defined
    ///   in `txn`
    /// - `Conflict` if `txn` already holds a recording for the channel
    pub fn create_multi_array_recording(
        &self,
        txn: &mut Transaction,
        channel: &Channel,
        num_arrays: usize,
    ) -> Result<Arc<Recording>> {
        self.check_recording_target(txn, channel)?;
        let recording = Recording::new(
            channel.name(),
            channel.next_revision(),
            txn.globalrev,
            num_arrays,
        );
        Ok(self.stage_recording(txn, recording))
    }

    fn check_recording_target(&self, txn: &Transaction, channel: &Channel) -> Result<()> {
        self.check_owned(txn)?;
        if channel.db_id() != self.shared.id {
            return Err(RecDbError::InvalidState(format!(
                "channel {} belongs to another database",
                channel.name()
            )));
        }
        let registered = match txn.new_channels.get(channel.name()) {
            Some(pending) => std::ptr::eq(pending.as_ref(), channel),
            None => self
                .shared
                .read()
                .channels
                .get(channel.name())
                .is_some_and(|known| std::ptr::eq(known.as_ref(), channel)),
        };
        if !registered {
            return Err(RecDbError::ChannelNotFound {
                channel: channel.name().to_string(),
                globalrev: txn.globalrev - 1,
            });
        }
        if txn.recordings.contains_key(channel.name()) {
            return Err(RecDbError::Conflict(format!(
                "transaction {} already has a recording for {}",
                txn.id,
                channel.name()
            )));
        }
        Ok(())
    }

    fn stage_recording(&self, txn: &mut Transaction, recording: Recording) -> Arc<Recording> {
        let recording = Arc::new(recording);
        txn.recordings
            .insert(recording.channel().to_string(), recording.clone());
        self.shared
            .stats
            .recordings_created
            .fetch_add(1, Ordering::Relaxed);
        recording
    }

    fn validate_commit(state: &DbState, txn: &Transaction) -> Result<()> {
        if state.latest.number() + 1 != txn.globalrev {
            return Err(RecDbError::InvalidState(format!(
                "transaction {} expected globalrev {} but latest is {}",
                txn.id,
                txn.globalrev,
                state.latest.number()
            )));
        }
        if let Some(name) = txn
            .new_channels
            .keys()
            .find(|name| state.channels.contains_key(name.as_str()))
        {
            return Err(RecDbError::Conflict(format!(
                "channel {name} was registered concurrently"
            )));
        }
        for (name, recording) in &txn.recordings {
            let known = txn.new_channels.contains_key(name) || state.channels.contains_key(name);
            if !known || recording.globalrev() != txn.globalrev {
                return Err(RecDbError::InvalidState(format!(
                    "recording for {name} does not belong to transaction {}",
                    txn.id
                )));
            }
        }
        Ok(())
    }

    /// Commits `txn` and publishes its effects as the next Globalrev.
    ///
    /// The new Globalrev is visible immediately, while its recordings may
    /// still be filling in. All monitors are woken.
    ///
    /// # Errors
    ///
    /// `InvalidState` or `Conflict` if validation fails. Nothing is published
    /// and the transaction is aborted.
    pub fn end_transaction(&self, mut txn: Transaction) -> Result<Globalrev> {
        if let Err(err) = self.check_owned(&txn) {
            txn.abort();
            return Err(err);
        }

        let mut state = self.shared.write();
        if let Err(err) = Self::validate_commit(&state, &txn) {
            drop(state);
            debug!("Transaction {} rejected: {}", txn.id, err);
            txn.abort();
            return Err(err);
        }

        let new_channels = std::mem::take(&mut txn.new_channels);
        let recordings = std::mem::take(&mut txn.recordings);
        let number = txn.globalrev;
        for channel in new_channels.values() {
            channel.mark_created(number);
            state
                .channels
                .insert(channel.name().to_string(), channel.clone());
        }
        let depth = self.shared.config.history_depth;
        for (name, recording) in &recordings {
            if let Some(channel) = state.channels.get(name) {
                channel.append(recording.clone(), depth);
            }
        }

        let next = state.latest.successor(
            number,
            new_channels.keys().map(String::as_str),
            recordings
                .iter()
                .map(|(name, recording)| (name.as_str(), recording.clone())),
        );
        state.retained.push_back(next.clone());
        while state.retained.len() > self.shared.config.globalrev_retention.max(1) {
            state.retained.pop_front();
        }
        state.latest = next.clone();
        self.shared.monitors.broadcast(&next);
        drop(state);

        txn.finished = true;
        self.shared.writer.release(txn.id);

        let stats = &self.shared.stats;
        stats.transactions_committed.fetch_add(1, Ordering::Relaxed);
        stats
            .recordings_published
            .fetch_add(recordings.len() as u64, Ordering::Relaxed);
        stats
            .channels_defined
            .fetch_add(new_channels.len() as u64, Ordering::Relaxed);
        debug!(
            "Transaction {} committed globalrev {} ({} channels defined, {} recordings)",
            txn.id,
            number,
            new_channels.len(),
            recordings.len()
        );
        Ok(next)
    }

    /// Subscribes to Globalrevs committed from now on.
    pub fn start_monitoring_globalrevs(&self) -> RevisionMonitor {
        let config =
            MonitorConfig::default().with_queue_limit(self.shared.config.monitor_queue_limit);
        self.start_monitoring_globalrevs_with(config)
    }

    /// Subscribes with an explicit monitor configuration.
    pub fn start_monitoring_globalrevs_with(&self, config: MonitorConfig) -> RevisionMonitor {
        let state = self.shared.read();
        self.shared
            .monitors
            .subscribe(state.latest.number(), &config)
    }

    /// Most recently committed Globalrev.
    pub fn latest_globalrev(&self) -> Globalrev {
        self.shared.read().latest.clone()
    }

    /// Looks up a retained Globalrev by number.
    ///
    /// # Errors
    ///
    /// `GlobalrevNotFound` if `number` was never issued or is older than the
    /// retention window.
    pub fn globalrev(&self, number: u64) -> Result<Globalrev> {
        let state = self.shared.read();
        let oldest = state
            .retained
            .front()
            .map(Globalrev::number)
            .unwrap_or_default();
        if number < oldest || number > state.latest.number() {
            return Err(RecDbError::GlobalrevNotFound(number));
        }
        // Retained numbers are contiguous.
        state
            .retained
            .get((number - oldest) as usize)
            .cloned()
            .ok_or(RecDbError::GlobalrevNotFound(number))
    }

    /// Looks up a committed channel by name.
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.shared.read().channels.get(name).cloned()
    }

    /// Names of all committed channels in order.
    pub fn channel_names(&self) -> Vec<String> {
        self.shared.read().channels.keys().cloned().collect()
    }

    /// Number of live revision monitors.
    pub fn monitor_count(&self) -> usize {
        self.shared.monitors.len()
    }

    /// Returns true while a transaction is open.
    pub fn transaction_open(&self) -> bool {
        self.shared.writer.holder().is_some()
    }
}
