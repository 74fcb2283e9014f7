//! Recordings - versioned bundles of named arrays plus metadata.
//!
//! A recording moves through an explicit three-state lifecycle:
//!
//! ```text
//! Created ──mark_metadata_done──► MetadataDone ──mark_data_ready──► DataReady
//!   │ define_array                  │ allocate_storage               │ read-only,
//!   │ allocate_storage              │ reference_ndarray (write)      │ lock-free
//!   │ set/add metadata              │                                │ reads
//!   │ reference_ndarray (write)     │                                │
//! ```
//!
//! Transitions are monotonic. Any call made in the wrong state fails with
//! [`RecDbError::InvalidState`]. The state lives in an atomic, slot
//! definitions and pending metadata behind one short-lived mutex, and each
//! slot's buffer behind its own mutex. A writer view locks only its slot, so
//! views on different slots coexist. `mark_data_ready` moves every buffer into
//! a write-once cell so readers never take a lock afterwards.

pub mod metadata;

use crate::error::{RecDbError, Result};
use crate::storage::{ArrayStorage, Element, ElementType};
use metadata::{MetaValue, Metadata};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, TryLockError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Slot name used by single-array recordings.
pub const DEFAULT_ARRAY_NAME: &str = "data";

/// Lifecycle state of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordingState {
    /// Arrays and metadata may still be defined.
    Created,
    /// Metadata is frozen; array contents are still writable.
    MetadataDone,
    /// Everything is frozen and safe to share without locks.
    DataReady,
}

impl RecordingState {
    /// Returns true if `next` is the single permitted successor state.
    pub fn can_transition_to(self, next: RecordingState) -> bool {
        matches!(
            (self, next),
            (RecordingState::Created, RecordingState::MetadataDone)
                | (RecordingState::MetadataDone, RecordingState::DataReady)
        )
    }

    const fn as_u8(self) -> u8 {
        match self {
            RecordingState::Created => 0,
            RecordingState::MetadataDone => 1,
            RecordingState::DataReady => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => RecordingState::Created,
            1 => RecordingState::MetadataDone,
            _ => RecordingState::DataReady,
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Created => "created",
            RecordingState::MetadataDone => "metadata-done",
            RecordingState::DataReady => "data-ready",
        };
        f.write_str(name)
    }
}

/// Selects an array slot by index or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKey<'a> {
    /// Slot index.
    Index(usize),
    /// Slot name.
    Name(&'a str),
}

impl From<usize> for ArrayKey<'_> {
    fn from(index: usize) -> Self {
        ArrayKey::Index(index)
    }
}

impl<'a> From<&'a str> for ArrayKey<'a> {
    fn from(name: &'a str) -> Self {
        ArrayKey::Name(name)
    }
}

impl<'a> From<&'a String> for ArrayKey<'a> {
    fn from(name: &'a String) -> Self {
        ArrayKey::Name(name)
    }
}

impl fmt::Display for ArrayKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayKey::Index(index) => write!(f, "#{index}"),
            ArrayKey::Name(name) => write!(f, "'{name}'"),
        }
    }
}

#[derive(Debug, Default)]
struct SlotDef {
    name: Option<String>,
    element_type: Option<ElementType>,
}

#[derive(Debug)]
struct Builder {
    metadata: Metadata,
    slots: Vec<SlotDef>,
}

impl Builder {
    fn resolve(&self, key: ArrayKey<'_>) -> Result<usize> {
        match key {
            ArrayKey::Index(index) if index < self.slots.len() => Ok(index),
            ArrayKey::Index(index) => Err(RecDbError::ArrayNotFound(format!(
                "slot {index} out of range for {} slots",
                self.slots.len()
            ))),
            ArrayKey::Name(name) => self
                .slots
                .iter()
                .position(|slot| slot.name.as_deref() == Some(name))
                .ok_or_else(|| RecDbError::ArrayNotFound(name.to_string())),
        }
    }
}

type SlotGuard<'a> = MutexGuard<'a, Option<ArrayStorage>>;

#[derive(Debug)]
struct FrozenArray {
    name: String,
    storage: ArrayStorage,
}

/// A versioned bundle of named arrays plus metadata on one channel.
///
/// Recordings are created through a transaction and shared as
/// `Arc<Recording>` between the producer, the channel history and every
/// [`Globalrev`](crate::Globalrev) snapshot that references them.
#[derive(Debug)]
pub struct Recording {
    channel: String,
    revision: u64,
    globalrev: u64,
    state: AtomicU8,
    builder: Mutex<Builder>,
    /// One buffer per slot, locked independently by writer views.
    buffers: Vec<Mutex<Option<ArrayStorage>>>,
    ready: Condvar,
    metadata: OnceLock<Metadata>,
    arrays: OnceLock<Vec<FrozenArray>>,
}

impl Recording {
    pub(crate) fn new(channel: &str, revision: u64, globalrev: u64, num_arrays: usize) -> Self {
        Self {
            channel: channel.to_string(),
            revision,
            globalrev,
            state: AtomicU8::new(RecordingState::Created.as_u8()),
            builder: Mutex::new(Builder {
                metadata: Metadata::new(),
                slots: (0..num_arrays).map(|_| SlotDef::default()).collect(),
            }),
            buffers: (0..num_arrays).map(|_| Mutex::new(None)).collect(),
            ready: Condvar::new(),
            metadata: OnceLock::new(),
            arrays: OnceLock::new(),
        }
    }

    pub(crate) fn new_single(
        channel: &str,
        revision: u64,
        globalrev: u64,
        element_type: ElementType,
    ) -> Self {
        let recording = Self::new(channel, revision, globalrev, 1);
        {
            let mut builder = recording.lock_builder();
            builder.slots[0].name = Some(DEFAULT_ARRAY_NAME.to_string());
            builder.slots[0].element_type = Some(element_type);
        }
        recording
    }

    fn lock_builder(&self) -> MutexGuard<'_, Builder> {
        self.builder.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Locks one slot buffer without waiting on a live writer view.
    fn try_lock_slot(&self, index: usize, what: &str) -> Result<SlotGuard<'_>> {
        match self.buffers[index].try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(err)) => Ok(err.into_inner()),
            Err(TryLockError::WouldBlock) => Err(RecDbError::InvalidState(format!(
                "{what}: slot {index} of {} has an active writer",
                self.channel
            ))),
        }
    }

    fn set_state(&self, state: RecordingState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn invalid(&self, what: &str, state: RecordingState) -> RecDbError {
        RecDbError::InvalidState(format!(
            "{what} on {} revision {} in state {state}",
            self.channel, self.revision
        ))
    }

    fn not_ready(&self) -> RecDbError {
        RecDbError::NotReady {
            channel: self.channel.clone(),
            revision: self.revision,
        }
    }

    /// Name of the owning channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Per-channel revision, strictly increasing from 1.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Globalrev whose transaction created this recording.
    pub fn globalrev(&self) -> u64 {
        self.globalrev
    }

    /// Number of array slots.
    pub fn num_arrays(&self) -> usize {
        self.buffers.len()
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> RecordingState {
        RecordingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns true once the recording is `DataReady`.
    pub fn is_ready(&self) -> bool {
        self.arrays.get().is_some()
    }

    /// Declares the name and element type of a slot.
    ///
    /// # Errors
    ///
    /// - `InvalidState` after `mark_metadata_done` or if the slot is already
    ///   defined
    /// - `ArrayNotFound` if `index` is out of range
    /// - `Conflict` if another slot already uses `name`
    pub fn define_array(&self, index: usize, element_type: ElementType, name: &str) -> Result<()> {
        let mut builder = self.lock_builder();
        let state = self.state();
        if state != RecordingState::Created {
            return Err(self.invalid("define_array", state));
        }
        let slot_index = builder.resolve(ArrayKey::Index(index))?;
        if builder.slots[slot_index].name.is_some() {
            return Err(RecDbError::InvalidState(format!(
                "slot {index} of {} already defined",
                self.channel
            )));
        }
        if builder
            .slots
            .iter()
            .any(|slot| slot.name.as_deref() == Some(name))
        {
            return Err(RecDbError::Conflict(format!(
                "array name '{name}' already used in {}",
                self.channel
            )));
        }

        let slot = &mut builder.slots[slot_index];
        slot.name = Some(name.to_string());
        slot.element_type = Some(element_type);
        Ok(())
    }

    /// Allocates a zeroed buffer of `shape` for a defined slot.
    ///
    /// # Errors
    ///
    /// - `InvalidState` once `DataReady`, for undefined or already
    ///   allocated slots
    /// - `ArrayNotFound` for unknown slots
    /// - `SizeError` for invalid shapes
    pub fn allocate_storage<'k>(
        &self,
        key: impl Into<ArrayKey<'k>>,
        shape: &[usize],
    ) -> Result<()> {
        let key = key.into();
        let builder = self.lock_builder();
        let state = self.state();
        if state == RecordingState::DataReady {
            return Err(self.invalid("allocate_storage", state));
        }
        let index = builder.resolve(key)?;
        let Some(element_type) = builder.slots[index].element_type else {
            return Err(RecDbError::InvalidState(format!(
                "slot {key} of {} is not defined",
                self.channel
            )));
        };
        let mut buffer = self.try_lock_slot(index, "allocate_storage")?;
        if buffer.is_some() {
            return Err(RecDbError::InvalidState(format!(
                "slot {key} of {} is already allocated",
                self.channel
            )));
        }
        *buffer = Some(ArrayStorage::allocate(element_type, shape)?);
        Ok(())
    }

    /// Replaces the pending metadata.
    pub fn set_metadata(&self, metadata: Metadata) -> Result<()> {
        let mut builder = self.lock_builder();
        let state = self.state();
        if state != RecordingState::Created {
            return Err(self.invalid("set_metadata", state));
        }
        builder.metadata = metadata;
        Ok(())
    }

    /// Adds one pending metadata entry.
    pub fn add_metadata(
        &self,
        key: impl Into<String>,
        value: impl Into<MetaValue>,
    ) -> Result<()> {
        let mut builder = self.lock_builder();
        let state = self.state();
        if state != RecordingState::Created {
            return Err(self.invalid("add_metadata", state));
        }
        builder.metadata.insert(key, value);
        Ok(())
    }

    /// Freezes the metadata. Irreversible.
    pub fn mark_metadata_done(&self) -> Result<()> {
        let mut builder = self.lock_builder();
        let state = self.state();
        if !state.can_transition_to(RecordingState::MetadataDone) {
            return Err(self.invalid("mark_metadata_done", state));
        }
        let metadata = std::mem::take(&mut builder.metadata);
        // Only this transition writes the cell, under the builder lock.
        let _ = self.metadata.set(metadata);
        self.set_state(RecordingState::MetadataDone);
        Ok(())
    }

    /// Returns a writable view into an allocated slot.
    ///
    /// The view locks only its own slot. Views on different slots may be held
    /// at the same time; a second view on a busy slot is refused rather than
    /// waited for.
    ///
    /// # Errors
    ///
    /// `InvalidState` once `DataReady`, if the slot is not allocated or if
    /// another view on the slot is alive.
    pub fn reference_ndarray<'k>(
        &self,
        key: impl Into<ArrayKey<'k>>,
    ) -> Result<ArrayWriter<'_>> {
        let key = key.into();
        let builder = self.lock_builder();
        let state = self.state();
        if state == RecordingState::DataReady {
            return Err(self.invalid("reference_ndarray", state));
        }
        let index = builder.resolve(key)?;
        let buffer = self.try_lock_slot(index, "reference_ndarray")?;
        if buffer.is_none() {
            return Err(RecDbError::InvalidState(format!(
                "slot {key} of {} has no storage allocated",
                self.channel
            )));
        }
        let name = builder.slots[index].name.clone().unwrap_or_default();
        Ok(ArrayWriter {
            buffer,
            name,
            index,
        })
    }

    /// Freezes all array contents and wakes readiness waiters. Irreversible.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the metadata is done, every slot is defined and
    /// allocated, and no writer view is alive.
    pub fn mark_data_ready(&self) -> Result<()> {
        let builder = self.lock_builder();
        let state = self.state();
        if !state.can_transition_to(RecordingState::DataReady) {
            return Err(self.invalid("mark_data_ready", state));
        }
        let mut buffers = (0..self.buffers.len())
            .map(|index| self.try_lock_slot(index, "mark_data_ready"))
            .collect::<Result<Vec<_>>>()?;
        if let Some(index) = builder
            .slots
            .iter()
            .zip(&buffers)
            .position(|(slot, buffer)| slot.name.is_none() || buffer.is_none())
        {
            return Err(RecDbError::InvalidState(format!(
                "slot {index} of {} is not defined and allocated",
                self.channel
            )));
        }

        let frozen = builder
            .slots
            .iter()
            .zip(buffers.iter_mut())
            .filter_map(|(slot, buffer)| {
                Some(FrozenArray {
                    name: slot.name.clone()?,
                    storage: buffer.take()?,
                })
            })
            .collect();
        let _ = self.arrays.set(frozen);
        self.set_state(RecordingState::DataReady);
        drop(buffers);
        drop(builder);

        self.ready.notify_all();
        debug!(
            "Recording {} revision {} is data-ready",
            self.channel, self.revision
        );
        Ok(())
    }

    /// Blocks until the recording is `DataReady`.
    pub fn wait_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut builder = self.lock_builder();
        while self.state() != RecordingState::DataReady {
            builder = self
                .ready
                .wait(builder)
                .unwrap_or_else(|err| err.into_inner());
        }
    }

    /// Blocks until the recording is `DataReady` or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Timeout` if the deadline passes first.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait_ready_until(Instant::now() + timeout, timeout)
    }

    pub(crate) fn wait_ready_until(&self, deadline: Instant, budget: Duration) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let mut builder = self.lock_builder();
        while self.state() != RecordingState::DataReady {
            let now = Instant::now();
            if now >= deadline {
                return Err(RecDbError::Timeout(budget));
            }
            let (next, _) = self
                .ready
                .wait_timeout(builder, deadline - now)
                .unwrap_or_else(|err| err.into_inner());
            builder = next;
        }
        Ok(())
    }

    /// Frozen metadata.
    ///
    /// # Errors
    ///
    /// `NotReady` before `mark_metadata_done`.
    pub fn metadata(&self) -> Result<&Metadata> {
        self.metadata.get().ok_or_else(|| self.not_ready())
    }

    /// Frozen array storage of one slot.
    ///
    /// # Errors
    ///
    /// `NotReady` before `mark_data_ready`; `ArrayNotFound` for unknown slots.
    pub fn array<'k>(&self, key: impl Into<ArrayKey<'k>>) -> Result<&ArrayStorage> {
        let key = key.into();
        let arrays = self.arrays.get().ok_or_else(|| self.not_ready())?;
        let found = match key {
            ArrayKey::Index(index) => arrays.get(index),
            ArrayKey::Name(name) => arrays.iter().find(|array| array.name == name),
        };
        found
            .map(|array| &array.storage)
            .ok_or_else(|| RecDbError::ArrayNotFound(format!("{key} in {}", self.channel)))
    }

    /// Typed read-only view of one slot.
    pub fn data<'k, T: Element>(&self, key: impl Into<ArrayKey<'k>>) -> Result<&[T]> {
        self.array(key)?.as_slice::<T>()
    }

    /// Names of the frozen slots in index order.
    pub fn array_names(&self) -> Result<Vec<&str>> {
        let arrays = self.arrays.get().ok_or_else(|| self.not_ready())?;
        Ok(arrays.iter().map(|array| array.name.as_str()).collect())
    }
}

/// Writable view into one slot of a recording that is still building.
///
/// Holds the lock of that slot only.
pub struct ArrayWriter<'a> {
    buffer: SlotGuard<'a>,
    name: String,
    index: usize,
}

impl ArrayWriter<'_> {
    fn storage(&self) -> Result<&ArrayStorage> {
        self.buffer
            .as_ref()
            .ok_or_else(|| RecDbError::InvalidState("array storage released".into()))
    }

    fn storage_mut(&mut self) -> Result<&mut ArrayStorage> {
        self.buffer
            .as_mut()
            .ok_or_else(|| RecDbError::InvalidState("array storage released".into()))
    }

    /// Name of the slot.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Element type of the slot.
    pub fn element_type(&self) -> Result<ElementType> {
        Ok(self.storage()?.element_type())
    }

    /// Shape of the slot.
    pub fn shape(&self) -> Result<Vec<usize>> {
        Ok(self.storage()?.shape().to_vec())
    }

    /// Mutable raw bytes.
    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        Ok(self.storage_mut()?.as_bytes_mut())
    }

    /// Mutable typed elements.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.storage_mut()?.as_mut_slice::<T>()
    }

    /// Copies `values` over the whole slot.
    pub fn copy_from_slice<T: Element>(&mut self, values: &[T]) -> Result<()> {
        self.storage_mut()?.copy_from_slice(values)
    }

    /// Sets every element to `value`.
    pub fn fill<T: Element>(&mut self, value: T) -> Result<()> {
        self.storage_mut()?.fill(value)
    }

    /// Writes one element at a multi-dimensional index.
    pub fn set<T: Element>(&mut self, index: &[usize], value: T) -> Result<()> {
        self.storage_mut()?.set(index, value)
    }
}

impl fmt::Debug for ArrayWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayWriter")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}
