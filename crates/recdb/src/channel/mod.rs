//! Channels - named streams holding the history of their recordings.
//!
//! History entries are keyed by the Globalrev that published them, so the
//! value of a channel as of Globalrev `G` is a single `BTreeMap` range lookup:
//! the last entry with key `<= G`.
//!
//! Only the newest `history_depth` entries are retained. Older recordings are
//! dropped from the history and freed once no retained [`Globalrev`] snapshot
//! still references them.
//!
//! [`Globalrev`]: crate::Globalrev

use crate::recording::Recording;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct ChannelHistory {
    /// Globalrev -> recording published at that Globalrev.
    entries: BTreeMap<u64, Arc<Recording>>,
    /// Revision of the most recently created recording.
    latest_revision: u64,
}

/// A named logical stream of versioned recordings.
#[derive(Debug)]
pub struct Channel {
    db_id: u64,
    name: String,
    owner: String,
    created_globalrev: OnceLock<u64>,
    history: RwLock<ChannelHistory>,
}

impl Channel {
    pub(crate) fn new(db_id: u64, name: &str, owner: &str) -> Self {
        Self {
            db_id,
            name: name.to_string(),
            owner: owner.to_string(),
            created_globalrev: OnceLock::new(),
            history: RwLock::new(ChannelHistory::default()),
        }
    }

    pub(crate) fn db_id(&self) -> u64 {
        self.db_id
    }

    /// Path-like channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the module that defined the channel.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Globalrev whose transaction defined the channel, once committed.
    pub fn created_globalrev(&self) -> Option<u64> {
        self.created_globalrev.get().copied()
    }

    pub(crate) fn mark_created(&self, globalrev: u64) {
        let _ = self.created_globalrev.set(globalrev);
    }

    /// Most recently published recording.
    pub fn latest(&self) -> Option<Arc<Recording>> {
        let history = self.history.read().unwrap_or_else(|err| err.into_inner());
        history.entries.values().next_back().cloned()
    }

    /// Recording that was latest as of `globalrev`.
    ///
    /// Returns `None` if the channel had no recording then, or if that entry
    /// has been pruned from the retained history.
    pub fn recording_at(&self, globalrev: u64) -> Option<Arc<Recording>> {
        let history = self.history.read().unwrap_or_else(|err| err.into_inner());
        // Pruned keys are all older than every retained key, so the last
        // retained entry at or below `globalrev` is always the right one.
        history
            .entries
            .range(..=globalrev)
            .next_back()
            .map(|(_, recording)| recording.clone())
    }

    /// Per-channel revisions of the retained history, oldest first.
    pub fn revisions(&self) -> Vec<u64> {
        let history = self.history.read().unwrap_or_else(|err| err.into_inner());
        history.entries.values().map(|rec| rec.revision()).collect()
    }

    /// Number of retained history entries.
    pub fn history_len(&self) -> usize {
        let history = self.history.read().unwrap_or_else(|err| err.into_inner());
        history.entries.len()
    }

    /// Revision the next recording on this channel will receive.
    pub(crate) fn next_revision(&self) -> u64 {
        let history = self.history.read().unwrap_or_else(|err| err.into_inner());
        history.latest_revision + 1
    }

    /// Appends a published recording and prunes history beyond `depth`.
    ///
    /// Returns the number of pruned entries.
    pub(crate) fn append(&self, recording: Arc<Recording>, depth: usize) -> usize {
        let mut history = self.history.write().unwrap_or_else(|err| err.into_inner());
        history.latest_revision = history.latest_revision.max(recording.revision());
        history.entries.insert(recording.globalrev(), recording);

        let mut pruned = 0;
        while history.entries.len() > depth.max(1) {
            history.entries.pop_first();
            pruned += 1;
        }
        if pruned > 0 {
            debug!("Pruned {} history entries from channel {}", pruned, self.name);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ElementType;

    fn published(channel: &Channel, globalrev: u64) -> Arc<Recording> {
        let rec = Arc::new(Recording::new_single(
            channel.name(),
            channel.next_revision(),
            globalrev,
            ElementType::UInt8,
        ));
        channel.append(rec.clone(), 8);
        rec
    }

    #[test]
    fn test_lookup_as_of_globalrev() {
        let channel = Channel::new(1, "/CAM0", "main");
        let r1 = published(&channel, 2);
        let r2 = published(&channel, 5);

        assert!(channel.recording_at(1).is_none());
        assert!(Arc::ptr_eq(&channel.recording_at(2).unwrap(), &r1));
        assert!(Arc::ptr_eq(&channel.recording_at(4).unwrap(), &r1));
        assert!(Arc::ptr_eq(&channel.recording_at(5).unwrap(), &r2));
        assert!(Arc::ptr_eq(&channel.recording_at(100).unwrap(), &r2));
        assert!(Arc::ptr_eq(&channel.latest().unwrap(), &r2));
    }

    #[test]
    fn test_revisions_strictly_increase() {
        let channel = Channel::new(1, "/CAM0", "main");
        for globalrev in [1, 3, 4, 9] {
            published(&channel, globalrev);
        }
        assert_eq!(channel.revisions(), vec![1, 2, 3, 4]);
        assert_eq!(channel.next_revision(), 5);
    }

    #[test]
    fn test_append_prunes_oldest() {
        let channel = Channel::new(1, "/CAM0", "main");
        let oldest = Arc::new(Recording::new_single("/CAM0", 1, 1, ElementType::UInt8));
        channel.append(oldest.clone(), 2);
        for globalrev in 2..=3 {
            let rec = Arc::new(Recording::new_single(
                "/CAM0",
                channel.next_revision(),
                globalrev,
                ElementType::UInt8,
            ));
            channel.append(rec, 2);
        }

        assert_eq!(channel.history_len(), 2);
        assert!(channel.recording_at(1).is_none());
        assert_eq!(channel.revisions(), vec![2, 3]);
        // Pruned history no longer keeps the recording alive.
        assert_eq!(Arc::strong_count(&oldest), 1);
    }

    #[test]
    fn test_created_globalrev_set_once() {
        let channel = Channel::new(1, "/CAM0", "main");
        assert_eq!(channel.created_globalrev(), None);
        channel.mark_created(3);
        channel.mark_created(7);
        assert_eq!(channel.created_globalrev(), Some(3));
    }
}
