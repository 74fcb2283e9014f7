//! Camera calibration bookkeeping on top of the recording database.
//!
//! A [`CalibrationRecorder`] captures frames from a camera channel, collects
//! checkerboard views and publishes its current parameters as one
//! multi-array recording:
//!
//! | slot | name          | type                 | shape     |
//! |-----:|---------------|----------------------|-----------|
//! | 0    | `brightfield` | image type           | image     |
//! | 1    | `darkfield`   | same as brightfield  | image     |
//! | 2    | `cam_mtx`     | float32              | `[3, 3]`  |
//! | 3    | `cam_dist`    | float32              | `[5]`     |
//! | 4    | `cam_newmtx`  | float32              | `[3, 3]`  |
//! | 5    | `cam_roi`     | int32                | `[4]`     |
//!
//! Corner detection and the camera model fit are external; they plug in
//! through [`CornerDetector`] and [`CalibrationSolver`]. Published parameters
//! are applied to camera frames by [`apply_calibration`].

mod image;
mod undistort;

pub use image::{to_gray8, GrayImage};
pub use undistort::{
    apply_calibration, LensModel, PinholeUndistorter, Undistorter, DISTORTION_LENGTHS,
};

use crate::channel::Channel;
use crate::db::globalrev::Globalrev;
use crate::db::RecDatabase;
use crate::error::{RecDbError, Result};
use crate::recording::metadata::Metadata;
use crate::recording::Recording;
use crate::storage::{ArrayStorage, ElementType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Array names of a calibration recording, in slot order.
pub const CALIBRATION_ARRAYS: [&str; 6] = [
    "brightfield",
    "darkfield",
    "cam_mtx",
    "cam_dist",
    "cam_newmtx",
    "cam_roi",
];

/// Element types accepted for the bright and dark field images.
pub const FIELD_ELEMENT_TYPES: [ElementType; 5] = [
    ElementType::UInt8,
    ElementType::UInt16,
    ElementType::Float16,
    ElementType::Float32,
    ElementType::Float64,
];

/// Configuration for a calibration recorder.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Channel frames are captured from.
    /// Default: `/CAMERA0`.
    pub camera_channel: String,
    /// Channel calibration parameters are published on.
    /// Default: `/calibration`.
    pub calibration_channel: String,
    /// Owner recorded on the calibration channel.
    /// Default: `main`.
    pub owner: String,
    /// Inner corners per checkerboard row and column.
    /// Default: 9 x 6.
    pub board: (usize, usize),
    /// Bound on every blocking wait; `None` waits indefinitely.
    /// Default: `None`.
    pub capture_timeout: Option<Duration>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            camera_channel: "/CAMERA0".to_string(),
            calibration_channel: "/calibration".to_string(),
            owner: "main".to_string(),
            board: (9, 6),
            capture_timeout: None,
        }
    }
}

impl CalibrationConfig {
    /// Sets the camera channel.
    pub fn with_camera_channel(mut self, camera_channel: impl Into<String>) -> Self {
        self.camera_channel = camera_channel.into();
        self
    }

    /// Sets the calibration channel.
    pub fn with_calibration_channel(mut self, calibration_channel: impl Into<String>) -> Self {
        self.calibration_channel = calibration_channel.into();
        self
    }

    /// Sets the checkerboard size in inner corners.
    pub fn with_board(mut self, width: usize, height: usize) -> Self {
        self.board = (width, height);
        self
    }

    /// Bounds every blocking wait.
    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = Some(timeout);
        self
    }
}

/// Camera model and flat-field images.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParameters {
    /// Flat-field image of a uniformly lit target.
    pub brightfield: ArrayStorage,
    /// Flat-field image with no light.
    pub darkfield: ArrayStorage,
    /// Intrinsic camera matrix.
    pub camera_matrix: [[f32; 3]; 3],
    /// Distortion coefficients `k1, k2, p1, p2, k3`.
    pub distortion: [f32; 5],
    /// Refined camera matrix for undistortion.
    pub new_camera_matrix: [[f32; 3]; 3],
    /// Valid pixel region `x, y, width, height`.
    pub roi: [i32; 4],
}

impl CalibrationParameters {
    /// Placeholder parameters: 3x3 white and black fields, a unit camera
    /// matrix centred on that field, no distortion and an unbounded region.
    pub fn placeholder() -> Result<Self> {
        let mut brightfield = ArrayStorage::allocate(ElementType::UInt8, &[3, 3])?;
        brightfield.fill(255u8)?;
        let darkfield = ArrayStorage::allocate(ElementType::UInt8, &[3, 3])?;
        let camera_matrix = [[1.0, 0.0, 1.5], [0.0, 1.0, 1.5], [0.0, 0.0, 1.0]];
        Ok(Self {
            brightfield,
            darkfield,
            camera_matrix,
            distortion: [0.0; 5],
            new_camera_matrix: camera_matrix,
            roi: [0, 0, -1, -1],
        })
    }

    /// Reads parameters back from a published calibration recording.
    ///
    /// # Errors
    ///
    /// `NotReady`, `ArrayNotFound` or `TypeMismatch` if the recording is not
    /// a complete calibration recording.
    pub fn from_recording(recording: &Recording) -> Result<Self> {
        Ok(Self {
            brightfield: recording.array("brightfield")?.clone(),
            darkfield: recording.array("darkfield")?.clone(),
            camera_matrix: matrix3(recording.data::<f32>("cam_mtx")?)?,
            distortion: fixed(recording.data::<f32>("cam_dist")?)?,
            new_camera_matrix: matrix3(recording.data::<f32>("cam_newmtx")?)?,
            roi: fixed(recording.data::<i32>("cam_roi")?)?,
        })
    }
}

fn fixed<T: Copy, const N: usize>(values: &[T]) -> Result<[T; N]> {
    values
        .try_into()
        .map_err(|_| RecDbError::SizeError(format!("expected {N} values, got {}", values.len())))
}

fn matrix3(values: &[f32]) -> Result<[[f32; 3]; 3]> {
    let flat: [f32; 9] = fixed(values)?;
    Ok([
        [flat[0], flat[1], flat[2]],
        [flat[3], flat[4], flat[5]],
        [flat[6], flat[7], flat[8]],
    ])
}

/// Image preprocessing requested from a [`CornerDetector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionOptions {
    /// Binarize with a local adaptive threshold instead of a global one.
    /// Default: false.
    pub adaptive_threshold: bool,
}

impl DetectionOptions {
    /// Sets adaptive thresholding.
    pub fn with_adaptive_threshold(mut self, adaptive_threshold: bool) -> Self {
        self.adaptive_threshold = adaptive_threshold;
        self
    }
}

/// Finds checkerboard inner corners in a gray image.
pub trait CornerDetector {
    /// Returns the `board.0 * board.1` corners in row-major board order as
    /// `[x, y]` pixel positions, or `None` if the pattern is not visible.
    fn find_corners(
        &mut self,
        image: &GrayImage,
        board: (usize, usize),
        options: &DetectionOptions,
    ) -> Result<Option<Vec<[f32; 2]>>>;
}

/// Result of a camera model fit.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSolution {
    /// Intrinsic camera matrix.
    pub camera_matrix: [[f32; 3]; 3],
    /// Distortion coefficients.
    pub distortion: [f32; 5],
    /// Refined camera matrix.
    pub new_camera_matrix: [[f32; 3]; 3],
    /// Valid pixel region.
    pub roi: [i32; 4],
}

/// Fits a camera model to corresponding object and image points.
pub trait CalibrationSolver {
    /// `image_size` is `(width, height)` in pixels.
    fn solve(
        &mut self,
        object_points: &[Vec<[f32; 3]>],
        image_points: &[Vec<[f32; 2]>],
        image_size: (usize, usize),
    ) -> Result<CameraSolution>;
}

/// Planar object points of a `width x height` board, row by row.
pub fn object_grid(width: usize, height: usize) -> Vec<[f32; 3]> {
    (0..height)
        .flat_map(|j| (0..width).map(move |i| [i as f32, j as f32, 0.0]))
        .collect()
}

/// Captures calibration inputs and publishes calibration parameters.
#[derive(Debug)]
pub struct CalibrationRecorder {
    db: RecDatabase,
    config: CalibrationConfig,
    channel: Arc<Channel>,
    parameters: CalibrationParameters,
    object_points: Vec<Vec<[f32; 3]>>,
    image_points: Vec<Vec<[f32; 2]>>,
    view_shape: Option<(usize, usize)>,
}

impl CalibrationRecorder {
    /// Defines the calibration channel and publishes placeholder parameters.
    pub fn new(db: &RecDatabase, config: CalibrationConfig) -> Result<Self> {
        let mut txn = db.start_transaction();
        let channel = db.define_channel(&mut txn, &config.calibration_channel, &config.owner)?;
        db.end_transaction(txn)?;

        let recorder = Self {
            db: db.clone(),
            config,
            channel,
            parameters: CalibrationParameters::placeholder()?,
            object_points: Vec::new(),
            image_points: Vec::new(),
            view_shape: None,
        };
        recorder.publish_calibration()?;
        Ok(recorder)
    }

    /// Calibration channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Recorder configuration.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Current parameters.
    pub fn parameters(&self) -> &CalibrationParameters {
        &self.parameters
    }

    /// Replaces the flat-field images.
    pub fn set_fields(&mut self, brightfield: ArrayStorage, darkfield: ArrayStorage) {
        self.parameters.brightfield = brightfield;
        self.parameters.darkfield = darkfield;
    }

    /// Number of captured checkerboard views.
    pub fn view_count(&self) -> usize {
        self.image_points.len()
    }

    /// Shape `(height, width)` of the captured views.
    pub fn view_shape(&self) -> Option<(usize, usize)> {
        self.view_shape
    }

    /// Discards all captured checkerboard views.
    pub fn clear_views(&mut self) {
        self.object_points.clear();
        self.image_points.clear();
        self.view_shape = None;
    }

    /// Publishes the current parameters as a six-array recording and waits
    /// until the resulting Globalrev is complete.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` if the field images have unsupported or differing
    /// element types; `Timeout` if a configured wait elapses.
    pub fn publish_calibration(&self) -> Result<Globalrev> {
        let params = &self.parameters;
        let field_type = params.brightfield.element_type();
        if !FIELD_ELEMENT_TYPES.contains(&field_type) {
            return Err(RecDbError::TypeMismatch {
                expected: ElementType::UInt8,
                actual: field_type,
            });
        }
        if params.darkfield.element_type() != field_type {
            return Err(RecDbError::TypeMismatch {
                expected: field_type,
                actual: params.darkfield.element_type(),
            });
        }

        let types = [
            field_type,
            field_type,
            ElementType::Float32,
            ElementType::Float32,
            ElementType::Float32,
            ElementType::Int32,
        ];
        let mut txn = self.db.start_transaction();
        let recording = self
            .db
            .create_multi_array_recording(&mut txn, &self.channel, CALIBRATION_ARRAYS.len())?;
        for (index, (name, element_type)) in CALIBRATION_ARRAYS.iter().zip(types).enumerate() {
            recording.define_array(index, element_type, name)?;
        }
        let globalrev = self.db.end_transaction(txn)?;

        recording.allocate_storage("brightfield", params.brightfield.shape())?;
        recording.allocate_storage("darkfield", params.darkfield.shape())?;
        recording.allocate_storage("cam_mtx", &[3, 3])?;
        recording.allocate_storage("cam_dist", &[5])?;
        recording.allocate_storage("cam_newmtx", &[3, 3])?;
        recording.allocate_storage("cam_roi", &[4])?;
        recording.set_metadata(
            Metadata::new()
                .with("calibration-board_width", self.config.board.0 as u64)
                .with("calibration-board_height", self.config.board.1 as u64)
                .with("calibration-views", self.image_points.len() as u64),
        )?;
        recording.mark_metadata_done()?;

        recording
            .reference_ndarray("brightfield")?
            .as_bytes_mut()?
            .copy_from_slice(params.brightfield.as_bytes());
        recording
            .reference_ndarray("darkfield")?
            .as_bytes_mut()?
            .copy_from_slice(params.darkfield.as_bytes());
        recording
            .reference_ndarray("cam_mtx")?
            .copy_from_slice(params.camera_matrix.as_flattened())?;
        recording
            .reference_ndarray("cam_dist")?
            .copy_from_slice(&params.distortion)?;
        recording
            .reference_ndarray("cam_newmtx")?
            .copy_from_slice(params.new_camera_matrix.as_flattened())?;
        recording
            .reference_ndarray("cam_roi")?
            .copy_from_slice(&params.roi)?;
        recording.mark_data_ready()?;

        match self.config.capture_timeout {
            Some(timeout) => globalrev.wait_complete_timeout(timeout)?,
            None => globalrev.wait_complete(),
        }
        debug!(
            "Calibration published on {} at globalrev {}",
            self.channel.name(),
            globalrev.number()
        );
        Ok(globalrev)
    }

    /// Waits for the next Globalrev and returns the camera recording in it,
    /// once data-ready.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound`/`RecordingNotFound` if the camera channel has no
    /// recording; `Timeout` if a configured wait elapses.
    pub fn capture_frame(&self) -> Result<Arc<Recording>> {
        let globalrev = {
            let monitor = self.db.start_monitoring_globalrevs();
            let next = match self.config.capture_timeout {
                Some(timeout) => monitor.wait_next_timeout(timeout),
                None => monitor.wait_next(),
            };
            monitor.close();
            next?
        };

        let recording = globalrev.get_recording_ref(&self.config.camera_channel)?;
        match self.config.capture_timeout {
            Some(timeout) => recording.wait_ready_timeout(timeout)?,
            None => recording.wait_ready(),
        }
        Ok(recording)
    }

    /// Captures the next camera frame as the bright field image.
    pub fn capture_brightfield(&mut self) -> Result<()> {
        let recording = self.capture_frame()?;
        self.parameters.brightfield = recording.array(0)?.clone();
        Ok(())
    }

    /// Captures the next camera frame as the dark field image.
    pub fn capture_darkfield(&mut self) -> Result<()> {
        let recording = self.capture_frame()?;
        self.parameters.darkfield = recording.array(0)?.clone();
        Ok(())
    }

    /// Captures the next camera frame and records its checkerboard corners
    /// for the configured board.
    ///
    /// Views of a different image shape are discarded first. Returns the
    /// number of captured views.
    ///
    /// # Errors
    ///
    /// `Calibration` if the pattern is not found or the detector returns the
    /// wrong number of corners.
    pub fn capture_checkerboard<D: CornerDetector + ?Sized>(
        &mut self,
        detector: &mut D,
    ) -> Result<usize> {
        let board = self.config.board;
        self.capture_checkerboard_with(detector, board, &DetectionOptions::default())
    }

    /// [`capture_checkerboard`](Self::capture_checkerboard) with an explicit
    /// board size in inner corners and detection options.
    pub fn capture_checkerboard_with<D: CornerDetector + ?Sized>(
        &mut self,
        detector: &mut D,
        board: (usize, usize),
        options: &DetectionOptions,
    ) -> Result<usize> {
        let recording = self.capture_frame()?;
        let gray = to_gray8(recording.array(0)?)?;
        self.add_view_with(&gray, detector, board, options)
    }

    /// Records the checkerboard corners of an already captured gray image.
    pub fn add_view<D: CornerDetector + ?Sized>(
        &mut self,
        gray: &GrayImage,
        detector: &mut D,
    ) -> Result<usize> {
        let board = self.config.board;
        self.add_view_with(gray, detector, board, &DetectionOptions::default())
    }

    /// [`add_view`](Self::add_view) with an explicit board size and detection
    /// options.
    ///
    /// # Errors
    ///
    /// `Calibration` for an empty board, a missing pattern or a wrong corner
    /// count.
    pub fn add_view_with<D: CornerDetector + ?Sized>(
        &mut self,
        gray: &GrayImage,
        detector: &mut D,
        board: (usize, usize),
        options: &DetectionOptions,
    ) -> Result<usize> {
        let (width, height) = board;
        if width == 0 || height == 0 {
            return Err(RecDbError::Calibration(format!(
                "board of {width}x{height} inner corners"
            )));
        }
        let shape = gray.shape();
        match self.view_shape {
            Some(previous) if previous != shape => {
                warn!(
                    "Image shape changed from {:?} to {:?}; discarding {} captured views",
                    previous,
                    shape,
                    self.image_points.len()
                );
                self.clear_views();
                self.view_shape = Some(shape);
            }
            Some(_) => {}
            None => self.view_shape = Some(shape),
        }

        let corners = detector
            .find_corners(gray, board, options)?
            .ok_or_else(|| RecDbError::Calibration("checkerboard pattern not found".into()))?;
        if corners.len() != width * height {
            return Err(RecDbError::Calibration(format!(
                "expected {} corners, detector returned {}",
                width * height,
                corners.len()
            )));
        }

        self.object_points.push(object_grid(width, height));
        self.image_points.push(corners);
        Ok(self.image_points.len())
    }

    /// Undistorts the next camera frame with the latest published parameters
    /// and publishes the result on `output`.
    ///
    /// # Errors
    ///
    /// Errors of [`capture_frame`](Self::capture_frame) and
    /// [`apply_calibration`].
    pub fn undistort_next_frame<U: Undistorter + ?Sized>(
        &self,
        output: &Channel,
        undistorter: &mut U,
    ) -> Result<Arc<Recording>> {
        let frame = self.capture_frame()?;
        let calibration = self
            .db
            .latest_globalrev()
            .get_recording_ref(self.channel.name())?;
        apply_calibration(&self.db, &frame, &calibration, output, undistorter)
    }

    /// Fits the camera model to the captured views and stores the result.
    ///
    /// Call [`publish_calibration`](Self::publish_calibration) to publish it.
    ///
    /// # Errors
    ///
    /// `Calibration` if no views were captured; solver errors otherwise.
    pub fn process_calibration<S: CalibrationSolver + ?Sized>(
        &mut self,
        solver: &mut S,
    ) -> Result<()> {
        let Some((height, width)) = self.view_shape.filter(|_| !self.image_points.is_empty()) else {
            return Err(RecDbError::Calibration(
                "capture checkerboard images first".into(),
            ));
        };
        let solution = solver.solve(&self.object_points, &self.image_points, (width, height))?;
        self.parameters.camera_matrix = solution.camera_matrix;
        self.parameters.distortion = solution.distortion;
        self.parameters.new_camera_matrix = solution.new_camera_matrix;
        self.parameters.roi = solution.roi;
        debug!(
            "Camera model fitted from {} views of {}x{}",
            self.image_points.len(),
            width,
            height
        );
        Ok(())
    }
}
