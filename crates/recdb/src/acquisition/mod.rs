//! Camera acquisition - streams frames from a [`FrameSource`] into a channel.
//!
//! ```text
//!            stop (mpsc)                 per frame:
//! Camera ──────────────────► worker ──► start_transaction
//!   │                          │        create_recording(uint8)
//!   │ get/set_parameter        │        end_transaction      (Globalrev visible)
//!   ▼                          │        metadata, metadata_done
//! Arc<Mutex<S: FrameSource>> ◄─┘        allocate [h, w], write mean
//!                                       mark_data_ready
//! ```
//!
//! The loop never waits for `Globalrev::wait_complete`: it completes its own
//! recording before reading the next frame, and readers that need complete
//! snapshots wait themselves.

mod frame;
mod params;

pub use frame::{Frame, FrameSource};
pub use params::{CameraParameter, ParameterSpec, ParameterValue};

use crate::channel::Channel;
use crate::db::RecDatabase;
use crate::error::{RecDbError, Result};
use crate::recording::metadata::Metadata;
use crate::recording::Recording;
use crate::storage::ElementType;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Configuration for a camera driver.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Device index, used to derive the default channel name.
    pub camera_index: u32,
    /// Channel frames are published on.
    /// Default: `/CAMERA{camera_index}`.
    pub channel_name: String,
    /// Owner recorded on the channel.
    /// Default: `main`.
    pub owner: String,
    /// Extra metadata attached to every frame.
    pub metadata: Metadata,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::for_camera(0)
    }
}

impl AcquisitionConfig {
    /// Default configuration for device `camera_index`.
    pub fn for_camera(camera_index: u32) -> Self {
        Self {
            camera_index,
            channel_name: format!("/CAMERA{camera_index}"),
            owner: "main".to_string(),
            metadata: Metadata::new(),
        }
    }

    /// Sets the channel name.
    pub fn with_channel_name(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    /// Sets the channel owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the metadata attached to every frame.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Publishes one frame as a new single-array uint8 recording.
///
/// The recording holds the per-pixel channel mean with shape `[height, width]`.
/// Returns the recording after it has been marked data-ready.
pub fn publish_frame(
    db: &RecDatabase,
    channel: &Channel,
    frame: &Frame,
    extra: &Metadata,
) -> Result<Arc<Recording>> {
    let gray = frame.channel_mean()?;

    let mut txn = db.start_transaction();
    let recording = db.create_recording(&mut txn, channel, ElementType::UInt8)?;
    db.end_transaction(txn)?;

    let mut metadata = Metadata::new()
        .with_axis(0, "Y Position", "pixels", 0.0, 1.0)
        .with_axis(1, "X Position", "pixels", 0.0, 1.0)
        .with_amplitude("Intensity", "arb");
    metadata.merge(extra);
    recording.set_metadata(metadata)?;
    recording.mark_metadata_done()?;
    recording.allocate_storage(0, &[frame.height(), frame.width()])?;
    recording.reference_ndarray(0)?.copy_from_slice(&gray)?;
    recording.mark_data_ready()?;
    Ok(recording)
}

fn lock_source<S>(source: &Mutex<S>) -> MutexGuard<'_, S> {
    source.lock().unwrap_or_else(|err| err.into_inner())
}

/// Reads every table parameter the source reports; unreadable ones are skipped.
fn parameter_metadata<S: FrameSource>(source: &S) -> Metadata {
    let mut metadata = Metadata::new();
    for kind in CameraParameter::ALL {
        let spec = kind.spec();
        if let Ok(raw) = source.get_control(spec.control_id) {
            metadata.insert(spec.metadata_key(), (spec.metadata)((spec.decode)(raw), spec.units));
        }
    }
    metadata
}

fn acquisition_loop<S: FrameSource>(
    db: RecDatabase,
    channel: Arc<Channel>,
    source: Arc<Mutex<S>>,
    extra: Metadata,
    stop: Receiver<()>,
) -> Result<u64> {
    let mut frames = 0u64;
    let result = loop {
        match stop.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break Ok(frames),
            Err(TryRecvError::Empty) => {}
        }

        let (frame, mut metadata) = {
            let mut source = lock_source(&source);
            match source.read_frame() {
                Ok(frame) => (frame, parameter_metadata(&*source)),
                Err(err) => break Err(err),
            }
        };
        metadata.merge(&extra);
        if let Err(err) = publish_frame(&db, &channel, &frame, &metadata) {
            break Err(err);
        }
        frames += 1;
    };

    lock_source(&source).release();
    match &result {
        Ok(frames) => debug!("Acquisition on {} stopped after {} frames", channel.name(), frames),
        Err(err) => error!(
            "Acquisition on {} stopped after {} frames: {}",
            channel.name(),
            frames,
            err
        ),
    }
    result
}

#[derive(Debug)]
struct AcquisitionWorker {
    stop: Sender<()>,
    handle: JoinHandle<Result<u64>>,
}

impl AcquisitionWorker {
    fn join(self) -> Result<u64> {
        let _ = self.stop.send(());
        self.handle
            .join()
            .unwrap_or_else(|_| Err(RecDbError::Device("acquisition thread panicked".into())))
    }
}

/// Camera driver publishing frames from a [`FrameSource`] on one channel.
#[derive(Debug)]
pub struct Camera<S: FrameSource> {
    db: RecDatabase,
    channel: Arc<Channel>,
    config: AcquisitionConfig,
    source: Arc<Mutex<S>>,
    worker: Option<AcquisitionWorker>,
}

impl<S: FrameSource> Camera<S> {
    /// Defines the camera channel in its own transaction.
    ///
    /// Acquisition is not started; call [`start_acquisition`](Self::start_acquisition).
    pub fn new(db: &RecDatabase, config: AcquisitionConfig, source: S) -> Result<Self> {
        let mut txn = db.start_transaction();
        let channel = db.define_channel(&mut txn, &config.channel_name, &config.owner)?;
        db.end_transaction(txn)?;
        Ok(Self {
            db: db.clone(),
            channel,
            config,
            source: Arc::new(Mutex::new(source)),
            worker: None,
        })
    }

    /// Channel frames are published on.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Driver configuration.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Returns true while the acquisition thread runs.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Spawns the acquisition thread. Does nothing if it already runs.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::Device` if the thread cannot be spawned.
    pub fn start_acquisition(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Acquisition on {} already running", self.channel.name());
            return Ok(());
        }
        if let Some(finished) = self.worker.take() {
            if let Err(err) = finished.join() {
                warn!("Previous acquisition on {} ended with: {}", self.channel.name(), err);
            }
        }

        let (stop, stop_rx) = mpsc::channel();
        let db = self.db.clone();
        let channel = self.channel.clone();
        let source = self.source.clone();
        let extra = self.config.metadata.clone();
        let handle = thread::Builder::new()
            .name(format!("acquisition{}", self.channel.name().replace('/', "-")))
            .spawn(move || acquisition_loop(db, channel, source, extra, stop_rx))
            .map_err(|err| {
                RecDbError::Device(format!("failed to spawn acquisition thread: {err}"))
            })?;
        self.worker = Some(AcquisitionWorker { stop, handle });
        debug!("Acquisition on {} started", self.channel.name());
        Ok(())
    }

    /// Signals the acquisition thread to stop and joins it.
    ///
    /// Returns the number of frames published, or the error that ended the
    /// loop. Returns `Ok(0)` if acquisition was not started.
    pub fn stop_acquisition(&mut self) -> Result<u64> {
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(0),
        }
    }

    /// Stops, joins and starts the acquisition thread again.
    pub fn restart_acquisition(&mut self) -> Result<()> {
        if let Err(err) = self.stop_acquisition() {
            warn!("Acquisition on {} ended with: {}", self.channel.name(), err);
        }
        self.start_acquisition()
    }

    /// Reads a parameter by kind.
    pub fn parameter(&self, kind: CameraParameter) -> Result<ParameterValue> {
        let spec = kind.spec();
        let raw = lock_source(&self.source).get_control(spec.control_id)?;
        Ok((spec.decode)(raw))
    }

    /// Writes a parameter by kind.
    pub fn set_parameter_kind(&self, kind: CameraParameter, value: ParameterValue) -> Result<()> {
        let spec = kind.spec();
        let raw = (spec.encode)(value)?;
        lock_source(&self.source).set_control(spec.control_id, raw)?;
        debug!("Camera {} parameter {} set to {}", self.channel.name(), spec.name, value);
        Ok(())
    }

    /// Reads a parameter by name.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for unknown names; source errors otherwise.
    pub fn get_parameter(&self, name: &str) -> Result<ParameterValue> {
        self.parameter(CameraParameter::from_name(name)?)
    }

    /// Writes a parameter by name.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for unknown names or out-of-range values.
    pub fn set_parameter(&self, name: &str, value: impl Into<ParameterValue>) -> Result<()> {
        self.set_parameter_kind(CameraParameter::from_name(name)?, value.into())
    }

    /// Current parameters as recording metadata.
    pub fn parameter_metadata(&self) -> Metadata {
        parameter_metadata(&*lock_source(&self.source))
    }
}

impl<S: FrameSource> Drop for Camera<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.join() {
                warn!("Acquisition on {} ended with: {}", self.channel.name(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct StaticSource {
        controls: HashMap<i32, f64>,
    }

    impl FrameSource for StaticSource {
        fn read_frame(&mut self) -> Result<Frame> {
            Frame::from_u8(2, 2, 3, &[3; 12])
        }

        fn get_control(&self, control_id: i32) -> Result<f64> {
            self.controls
                .get(&control_id)
                .copied()
                .ok_or_else(|| RecDbError::Device(format!("control {control_id} unsupported")))
        }

        fn set_control(&mut self, control_id: i32, value: f64) -> Result<()> {
            self.controls.insert(control_id, value);
            Ok(())
        }
    }

    #[test]
    fn test_default_channel_name() {
        assert_eq!(AcquisitionConfig::for_camera(2).channel_name, "/CAMERA2");
        assert_eq!(AcquisitionConfig::default().owner, "main");
    }

    #[test]
    fn test_new_defines_channel() {
        let db = RecDatabase::new();
        let camera =
            Camera::new(&db, AcquisitionConfig::default(), StaticSource::default()).unwrap();
        assert_eq!(camera.channel().name(), "/CAMERA0");
        assert!(db.latest_globalrev().contains_channel("/CAMERA0"));
        assert!(!camera.is_running());
    }

    #[test]
    fn test_parameters_by_name() {
        let db = RecDatabase::new();
        let camera =
            Camera::new(&db, AcquisitionConfig::default(), StaticSource::default()).unwrap();
        camera.set_parameter("width", 640i64).unwrap();
        camera.set_parameter("exposure", -6.0).unwrap();
        assert_eq!(camera.get_parameter("width").unwrap(), ParameterValue::Int(640));
        assert_eq!(camera.get_parameter("exposure").unwrap(), ParameterValue::Float(-6.0));
        assert!(matches!(
            camera.get_parameter("zoom"),
            Err(RecDbError::InvalidParameter(_))
        ));
        assert!(matches!(
            camera.set_parameter("height", 0i64),
            Err(RecDbError::InvalidParameter(_))
        ));

        let metadata = camera.parameter_metadata();
        assert_eq!(metadata.get_int("camera-width"), Some(640));
        assert!(metadata.get("camera-gain").is_none());
    }

    #[test]
    fn test_publish_frame_metadata_and_data() {
        let db = RecDatabase::new();
        let camera =
            Camera::new(&db, AcquisitionConfig::default(), StaticSource::default()).unwrap();
        let frame = Frame::from_u8(1, 2, 3, &[0, 3, 6, 9, 9, 9]).unwrap();
        let metadata = Metadata::new().with("frame", 1u64);
        let rec = publish_frame(&db, camera.channel(), &frame, &metadata).unwrap();

        assert!(rec.is_ready());
        assert_eq!(rec.array(0).unwrap().shape(), &[1, 2]);
        assert_eq!(rec.data::<u8>(0).unwrap(), &[3, 9]);
        let metadata = rec.metadata().unwrap();
        assert_eq!(metadata.get_str("ande_array-axis1_coord"), Some("X Position"));
        assert_eq!(metadata.get_unsigned("frame"), Some(1));
    }
}
