//! RecDB - Alopex transactional recording database
//!
//! This crate provides a single-process, versioned store of multidimensional
//! array recordings for live sensor pipelines. Producers publish atomic,
//! globally numbered revisions; consumers block on a monitor and read
//! consistent cross-channel snapshots while producers keep writing.
//!
//! # Components
//!
//! - [`RecDatabase`]: channel registry, transactions and Globalrev publication
//! - [`Recording`]: versioned bundle of named arrays plus metadata
//! - [`Globalrev`]: immutable snapshot of every channel's latest recording
//! - [`RevisionMonitor`]: blocking subscription to newly committed Globalrevs
//! - [`acquisition::Camera`]: frame-source driver publishing onto a channel
//! - [`calibration::CalibrationRecorder`]: calibration capture and publication
//!
//! # Example
//!
//! ```rust
//! use alopex_recdb::{ElementType, RecDatabase};
//!
//! let db = RecDatabase::new();
//! let monitor = db.start_monitoring_globalrevs();
//!
//! // Producer: define a channel and publish a recording.
//! let mut txn = db.start_transaction();
//! let channel = db.define_channel(&mut txn, "/CAM0", "main")?;
//! let rec = db.create_recording(&mut txn, &channel, ElementType::UInt8)?;
//! let globalrev = db.end_transaction(txn)?;
//!
//! rec.mark_metadata_done()?;
//! rec.allocate_storage(0, &[2, 2])?;
//! rec.reference_ndarray(0)?.copy_from_slice(&[1u8, 2, 3, 4])?;
//! rec.mark_data_ready()?;
//!
//! // Consumer: wait for the revision and read a consistent snapshot.
//! let next = monitor.wait_next()?;
//! assert_eq!(next.number(), globalrev.number());
//! next.wait_complete();
//! let frame = next.get_recording_ref("/CAM0")?;
//! assert_eq!(frame.data::<u8>(0)?, &[1, 2, 3, 4]);
//! # Ok::<(), alopex_recdb::RecDbError>(())
//! ```

#![deny(missing_docs)]

pub mod acquisition;
pub mod calibration;
pub mod channel;
pub mod db;
pub mod error;
pub mod recording;
pub mod storage;

pub use channel::Channel;
pub use db::globalrev::Globalrev;
pub use db::monitor::{MonitorConfig, RevisionMonitor};
pub use db::transaction::Transaction;
pub use db::{RecDatabase, RecDbConfig, RecDbStats};
pub use error::{RecDbError, Result};
pub use recording::metadata::{MetaValue, Metadata};
pub use recording::{ArrayKey, ArrayWriter, Recording, RecordingState};
pub use storage::{ArrayLayout, ArrayStorage, Element, ElementType, Rgba32};
