//! Global revisions - consistent cross-channel snapshots.

use crate::error::{RecDbError, Result};
use crate::recording::Recording;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct GlobalrevInner {
    number: u64,
    /// Channel name -> latest recording, `None` for channels without one yet.
    channels: BTreeMap<String, Option<Arc<Recording>>>,
}

/// A committed database-wide revision.
///
/// A `Globalrev` is an immutable snapshot: the latest recording of every
/// channel as of its number. Cloning is cheap and a held handle keeps every
/// referenced recording alive, even after channel history prunes it.
///
/// A Globalrev becomes visible as soon as its transaction ends, which may be
/// before its recordings are filled in. Use [`Globalrev::wait_complete`] to
/// wait until every referenced recording is data-ready.
#[derive(Debug, Clone)]
pub struct Globalrev {
    inner: Arc<GlobalrevInner>,
}

impl Globalrev {
    /// The empty revision 0 every database starts from.
    pub(crate) fn initial() -> Self {
        Self {
            inner: Arc::new(GlobalrevInner {
                number: 0,
                channels: BTreeMap::new(),
            }),
        }
    }

    /// Builds the successor snapshot from this one plus a transaction's effects.
    pub(crate) fn successor<'a>(
        &self,
        number: u64,
        defined: impl IntoIterator<Item = &'a str>,
        updates: impl IntoIterator<Item = (&'a str, Arc<Recording>)>,
    ) -> Self {
        let mut channels = self.inner.channels.clone();
        for name in defined {
            channels.entry(name.to_string()).or_insert(None);
        }
        for (name, recording) in updates {
            channels.insert(name.to_string(), Some(recording));
        }
        Self {
            inner: Arc::new(GlobalrevInner { number, channels }),
        }
    }

    /// Revision number.
    pub fn number(&self) -> u64 {
        self.inner.number
    }

    /// Returns the recording that was latest for `channel` at this revision.
    ///
    /// # Errors
    ///
    /// - `ChannelNotFound` if the channel was not defined at this revision
    /// - `RecordingNotFound` if it was defined but held no recording yet
    pub fn get_recording_ref(&self, channel: &str) -> Result<Arc<Recording>> {
        match self.inner.channels.get(channel) {
            Some(Some(recording)) => Ok(recording.clone()),
            Some(None) => Err(RecDbError::RecordingNotFound {
                channel: channel.to_string(),
                globalrev: self.number(),
            }),
            None => Err(RecDbError::ChannelNotFound {
                channel: channel.to_string(),
                globalrev: self.number(),
            }),
        }
    }

    /// Returns true if the channel was defined at this revision.
    pub fn contains_channel(&self, channel: &str) -> bool {
        self.inner.channels.contains_key(channel)
    }

    /// Names of the channels defined at this revision.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.inner.channels.keys().map(String::as_str)
    }

    /// Channel/recording pairs of this snapshot in channel-name order.
    pub fn recordings(&self) -> impl Iterator<Item = (&str, &Arc<Recording>)> {
        self.inner
            .channels
            .iter()
            .filter_map(|(name, rec)| rec.as_ref().map(|rec| (name.as_str(), rec)))
    }

    /// Recordings of this snapshot that are not data-ready yet.
    pub fn pending_recordings(&self) -> Vec<Arc<Recording>> {
        self.recordings()
            .filter(|(_, rec)| !rec.is_ready())
            .map(|(_, rec)| rec.clone())
            .collect()
    }

    /// Returns true once every referenced recording is data-ready.
    pub fn is_complete(&self) -> bool {
        self.recordings().all(|(_, rec)| rec.is_ready())
    }

    /// Blocks until every referenced recording is data-ready.
    pub fn wait_complete(&self) {
        for (_, recording) in self.recordings() {
            recording.wait_ready();
        }
    }

    /// Blocks until complete or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Timeout` if some recording is still pending at the
    /// deadline.
    pub fn wait_complete_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for (_, recording) in self.recordings() {
            recording.wait_ready_until(deadline, timeout)?;
        }
        Ok(())
    }

    /// Returns true if both handles refer to the same snapshot.
    pub fn ptr_eq(&self, other: &Globalrev) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ElementType;

    fn ready(channel: &str, globalrev: u64) -> Arc<Recording> {
        let rec = Arc::new(Recording::new_single(channel, 1, globalrev, ElementType::UInt8));
        rec.mark_metadata_done().unwrap();
        rec.allocate_storage(0, &[1]).unwrap();
        rec.mark_data_ready().unwrap();
        rec
    }

    #[test]
    fn test_initial_is_empty_and_complete() {
        let rev = Globalrev::initial();
        assert_eq!(rev.number(), 0);
        assert!(rev.is_complete());
        assert!(matches!(
            rev.get_recording_ref("/CAM0"),
            Err(RecDbError::ChannelNotFound { globalrev: 0, .. })
        ));
    }

    #[test]
    fn test_successor_keeps_previous_entries() {
        let a = ready("/a", 1);
        let rev1 = Globalrev::initial().successor(1, ["/a", "/b"], [("/a", a.clone())]);
        let b = ready("/b", 2);
        let rev2 = rev1.successor(2, std::iter::empty::<&str>(), [("/b", b.clone())]);

        assert!(Arc::ptr_eq(&rev2.get_recording_ref("/a").unwrap(), &a));
        assert!(Arc::ptr_eq(&rev2.get_recording_ref("/b").unwrap(), &b));
        assert!(matches!(
            rev1.get_recording_ref("/b"),
            Err(RecDbError::RecordingNotFound { globalrev: 1, .. })
        ));
        assert_eq!(rev2.channel_names().collect::<Vec<_>>(), vec!["/a", "/b"]);
    }

    #[test]
    fn test_incomplete_until_ready() {
        let pending = Arc::new(Recording::new_single("/a", 1, 1, ElementType::UInt8));
        let rev = Globalrev::initial().successor(1, ["/a"], [("/a", pending.clone())]);
        assert!(!rev.is_complete());
        assert_eq!(rev.pending_recordings().len(), 1);
        assert!(matches!(
            rev.wait_complete_timeout(Duration::from_millis(10)),
            Err(RecDbError::Timeout(_))
        ));

        pending.mark_metadata_done().unwrap();
        pending.allocate_storage(0, &[1]).unwrap();
        pending.mark_data_ready().unwrap();
        assert!(rev.is_complete());
        rev.wait_complete();
    }
}
