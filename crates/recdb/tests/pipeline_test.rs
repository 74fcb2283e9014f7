//! Integration tests for the camera acquisition and calibration pipeline.
//!
//! A synthetic frame source stands in for the camera device, and fixed
//! detector/solver implementations stand in for the vision algorithms.

use alopex_recdb::acquisition::{AcquisitionConfig, Camera, Frame, FrameSource, ParameterValue};
use alopex_recdb::calibration::{
    CalibrationConfig, CalibrationParameters, CalibrationRecorder, CalibrationSolver,
    CameraSolution, CornerDetector, DetectionOptions, GrayImage, PinholeUndistorter,
};
use alopex_recdb::{ElementType, RecDatabase, RecDbError, Result};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Emits 4x6 BGR frames whose samples all equal the frame counter.
#[derive(Debug, Default)]
struct SyntheticSource {
    frames: u8,
    fail_after: Option<u8>,
    controls: HashMap<i32, f64>,
    released: bool,
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if self.fail_after == Some(self.frames) {
            return Err(RecDbError::Device("sensor unplugged".into()));
        }
        thread::sleep(Duration::from_millis(1));
        self.frames = self.frames.wrapping_add(1);
        Frame::from_u8(4, 6, 3, &[self.frames; 4 * 6 * 3])
    }

    fn get_control(&self, control_id: i32) -> Result<f64> {
        Ok(self.controls.get(&control_id).copied().unwrap_or(0.0))
    }

    fn set_control(&mut self, control_id: i32, value: f64) -> Result<()> {
        self.controls.insert(control_id, value);
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
    }
}

struct GridDetector;

impl CornerDetector for GridDetector {
    fn find_corners(
        &mut self,
        image: &GrayImage,
        board: (usize, usize),
        _options: &DetectionOptions,
    ) -> Result<Option<Vec<[f32; 2]>>> {
        let (width, height) = board;
        let step_x = image.width() as f32 / (width + 1) as f32;
        let step_y = image.height() as f32 / (height + 1) as f32;
        Ok(Some(
            (0..height)
                .flat_map(|j| {
                    (0..width).map(move |i| [(i + 1) as f32 * step_x, (j + 1) as f32 * step_y])
                })
                .collect(),
        ))
    }
}

struct CentredSolver;

impl CalibrationSolver for CentredSolver {
    fn solve(
        &mut self,
        object_points: &[Vec<[f32; 3]>],
        image_points: &[Vec<[f32; 2]>],
        image_size: (usize, usize),
    ) -> Result<CameraSolution> {
        assert_eq!(object_points.len(), image_points.len());
        let (w, h) = (image_size.0 as f32, image_size.1 as f32);
        let matrix = [[100.0, 0.0, w / 2.0], [0.0, 100.0, h / 2.0], [0.0, 0.0, 1.0]];
        Ok(CameraSolution {
            camera_matrix: matrix,
            distortion: [0.1, 0.0, 0.0, 0.0, 0.0],
            new_camera_matrix: matrix,
            roi: [0, 0, image_size.0 as i32, image_size.1 as i32],
        })
    }
}

fn camera(db: &RecDatabase) -> Camera<SyntheticSource> {
    Camera::new(db, AcquisitionConfig::for_camera(0), SyntheticSource::default()).unwrap()
}

#[test]
fn test_acquisition_streams_frames() {
    let db = RecDatabase::new();
    let mut camera = camera(&db);
    camera.set_parameter("fps", 30.0).unwrap();
    let monitor = db.start_monitoring_globalrevs();
    camera.start_acquisition().unwrap();
    assert!(camera.is_running());
    // A second start is a no-op while running.
    camera.start_acquisition().unwrap();

    for _ in 0..3 {
        let rev = monitor.wait_next_timeout(TIMEOUT).unwrap();
        let rec = rev.get_recording_ref("/CAMERA0").unwrap();
        rec.wait_ready_timeout(TIMEOUT).unwrap();
        assert_eq!(rec.array(0).unwrap().shape(), &[4, 6]);
        assert_eq!(rec.array(0).unwrap().element_type(), ElementType::UInt8);
        let data = rec.data::<u8>(0).unwrap();
        assert!(data.iter().all(|&v| v == data[0]));
        assert_eq!(
            rec.metadata().unwrap().get_dbl("camera-fps"),
            Some((30.0, "Hz"))
        );
    }

    let frames = camera.stop_acquisition().unwrap();
    assert!(frames >= 3);
    assert!(!camera.is_running());
    assert_eq!(camera.channel().latest().unwrap().revision(), frames);
}

#[test]
fn test_restart_after_stop() {
    let db = RecDatabase::new();
    let mut camera = camera(&db);
    camera.start_acquisition().unwrap();
    camera.restart_acquisition().unwrap();
    assert!(camera.is_running());
    camera.stop_acquisition().unwrap();
    assert_eq!(camera.stop_acquisition().unwrap(), 0);
}

#[test]
fn test_device_error_ends_acquisition() {
    let db = RecDatabase::new();
    let source = SyntheticSource {
        fail_after: Some(2),
        ..SyntheticSource::default()
    };
    let mut camera = Camera::new(&db, AcquisitionConfig::for_camera(1), source).unwrap();
    camera.start_acquisition().unwrap();

    // The loop ends by itself after two frames.
    let mut waited = Duration::ZERO;
    while camera.is_running() && waited < TIMEOUT {
        thread::sleep(Duration::from_millis(5));
        waited += Duration::from_millis(5);
    }
    assert!(matches!(camera.stop_acquisition(), Err(RecDbError::Device(_))));
    assert_eq!(camera.channel().revisions(), vec![1, 2]);
    assert_eq!(camera.get_parameter("gain").unwrap(), ParameterValue::Float(0.0));
}

#[test]
fn test_calibration_from_live_camera() {
    let db = RecDatabase::new();
    let mut camera = camera(&db);
    let config = CalibrationConfig::default()
        .with_camera_channel("/CAMERA0")
        .with_board(3, 2)
        .with_capture_timeout(TIMEOUT);
    let mut recorder = CalibrationRecorder::new(&db, config).unwrap();
    camera.start_acquisition().unwrap();

    recorder.capture_brightfield().unwrap();
    recorder.capture_darkfield().unwrap();
    assert_eq!(recorder.parameters().brightfield.shape(), &[4, 6]);

    for expected in 1..=3 {
        assert_eq!(recorder.capture_checkerboard(&mut GridDetector).unwrap(), expected);
    }
    assert_eq!(recorder.view_shape(), Some((4, 6)));
    recorder.process_calibration(&mut CentredSolver).unwrap();
    let published = recorder.publish_calibration().unwrap();
    camera.stop_acquisition().unwrap();

    assert!(published.is_complete());
    let rec = published.get_recording_ref("/calibration").unwrap();
    let read_back = CalibrationParameters::from_recording(&rec).unwrap();
    assert_eq!(read_back.camera_matrix[0][2], 3.0);
    assert_eq!(read_back.roi, [0, 0, 6, 4]);
    assert_eq!(read_back.brightfield.shape(), &[4, 6]);
    assert_eq!(rec.metadata().unwrap().get_unsigned("calibration-views"), Some(3));
}

#[test]
fn test_undistort_live_frames() {
    let db = RecDatabase::new();
    let mut camera = camera(&db);
    let config = CalibrationConfig::default().with_capture_timeout(TIMEOUT);
    let recorder = CalibrationRecorder::new(&db, config).unwrap();
    let mut txn = db.start_transaction();
    let output = db.define_channel(&mut txn, "/CAMERA0/undistorted", "main").unwrap();
    db.end_transaction(txn).unwrap();
    camera.start_acquisition().unwrap();

    let first = recorder
        .undistort_next_frame(&output, &mut PinholeUndistorter)
        .unwrap();
    let second = recorder
        .undistort_next_frame(&output, &mut PinholeUndistorter)
        .unwrap();
    camera.stop_acquisition().unwrap();

    assert_eq!(output.revisions(), vec![1, 2]);
    assert_eq!(second.revision(), 2);
    for rec in [&first, &second] {
        assert!(rec.is_ready());
        assert_eq!(rec.array(0).unwrap().shape(), &[4, 6]);
        // Placeholder parameters leave uniform frames uniform.
        let data = rec.data::<u8>(0).unwrap();
        assert!(data.iter().all(|&v| v == data[0]));
        let metadata = rec.metadata().unwrap();
        assert_eq!(metadata.get_str("calibration-source_channel"), Some("/CAMERA0"));
        assert_eq!(metadata.get_unsigned("calibration-parameters_revision"), Some(1));
    }
}

#[test]
fn test_capture_times_out_without_camera() {
    let db = RecDatabase::new();
    let config = CalibrationConfig::default().with_capture_timeout(Duration::from_millis(20));
    let mut recorder = CalibrationRecorder::new(&db, config).unwrap();
    assert!(matches!(
        recorder.capture_brightfield(),
        Err(RecDbError::Timeout(_))
    ));
}
