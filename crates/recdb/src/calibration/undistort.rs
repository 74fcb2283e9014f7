//! Lens undistortion of camera frames with published calibration parameters.
//!
//! [`apply_calibration`] reads the camera model from a calibration recording,
//! converts the first array of a camera recording to gray, runs an
//! [`Undistorter`] over it and publishes the result as a new uint8 recording
//! of the same height and width:
//!
//! ```text
//! calibration rec ──► LensModel ─┐
//! camera rec ──► to_gray8 ───────┴─► Undistorter ──► txn ─► output rec
//!                                                         metadata-done
//!                                                         allocate, write
//!                                                         data-ready
//! ```

use super::image::{to_gray8, GrayImage};
use super::matrix3;
use crate::channel::Channel;
use crate::db::RecDatabase;
use crate::error::{RecDbError, Result};
use crate::recording::Recording;
use crate::storage::{ArrayStorage, ElementType};
use std::sync::Arc;
use tracing::debug;

/// Distortion coefficient counts of the supported lens models.
pub const DISTORTION_LENGTHS: [usize; 5] = [4, 5, 8, 12, 14];

/// Camera model read from a calibration recording.
#[derive(Debug, Clone, PartialEq)]
pub struct LensModel {
    /// Intrinsic matrix of the distorted source image.
    pub camera_matrix: [[f32; 3]; 3],
    /// Coefficients `k1, k2, p1, p2[, k3[, k4, k5, k6[, s1..s4[, tx, ty]]]]`.
    pub distortion: Vec<f32>,
    /// Intrinsic matrix of the undistorted output image.
    pub new_camera_matrix: [[f32; 3]; 3],
}

impl LensModel {
    /// Reads `cam_mtx`, `cam_dist` and `cam_newmtx` by name.
    ///
    /// Matrices must be 2-D `[3, 3]`; the coefficients 1-D or 2-D with one of
    /// the [`DISTORTION_LENGTHS`]. float32, uint16 and uint8 arrays are
    /// accepted.
    ///
    /// # Errors
    ///
    /// - `NotReady` or `ArrayNotFound` for incomplete calibration recordings
    /// - `TypeMismatch` for other element types
    /// - `SizeError` for other ranks or shapes
    /// - `Calibration` for a singular output matrix
    pub fn from_recording(calibration: &Recording) -> Result<Self> {
        let camera_matrix = parameter_matrix(calibration.array("cam_mtx")?, "cam_mtx")?;
        let new_camera_matrix =
            parameter_matrix(calibration.array("cam_newmtx")?, "cam_newmtx")?;

        let dist = calibration.array("cam_dist")?;
        if dist.shape().len() > 2 {
            return Err(RecDbError::SizeError(format!(
                "cam_dist must be 1-D or 2-D, got shape {:?}",
                dist.shape()
            )));
        }
        let distortion = parameter_values(dist)?;
        if !DISTORTION_LENGTHS.contains(&distortion.len()) {
            return Err(RecDbError::SizeError(format!(
                "cam_dist holds {} coefficients, expected one of {:?}",
                distortion.len(),
                DISTORTION_LENGTHS
            )));
        }

        let model = Self {
            camera_matrix,
            distortion,
            new_camera_matrix,
        };
        model.check()?;
        Ok(model)
    }

    fn check(&self) -> Result<()> {
        let [fx, fy] = [self.new_camera_matrix[0][0], self.new_camera_matrix[1][1]];
        if fx == 0.0 || fy == 0.0 || !fx.is_finite() || !fy.is_finite() {
            return Err(RecDbError::Calibration(format!(
                "new camera matrix has unusable focal lengths ({fx}, {fy})"
            )));
        }
        Ok(())
    }

    fn coefficient(&self, index: usize) -> f64 {
        self.distortion.get(index).copied().map_or(0.0, f64::from)
    }

    /// Position in the distorted source image seen by output pixel `(x, y)`.
    ///
    /// Tilt coefficients are ignored.
    pub fn source_position(&self, x: f64, y: f64) -> (f64, f64) {
        let new = &self.new_camera_matrix;
        let xn = (x - f64::from(new[0][2])) / f64::from(new[0][0]);
        let yn = (y - f64::from(new[1][2])) / f64::from(new[1][1]);

        let k = |index| self.coefficient(index);
        let r2 = xn * xn + yn * yn;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + k(0) * r2 + k(1) * r4 + k(4) * r6)
            / (1.0 + k(5) * r2 + k(6) * r4 + k(7) * r6);
        let (p1, p2) = (k(2), k(3));
        let xd = xn * radial
            + 2.0 * p1 * xn * yn
            + p2 * (r2 + 2.0 * xn * xn)
            + k(8) * r2
            + k(9) * r4;
        let yd = yn * radial
            + p1 * (r2 + 2.0 * yn * yn)
            + 2.0 * p2 * xn * yn
            + k(10) * r2
            + k(11) * r4;

        let cam = &self.camera_matrix;
        (
            f64::from(cam[0][0]) * xd + f64::from(cam[0][2]),
            f64::from(cam[1][1]) * yd + f64::from(cam[1][2]),
        )
    }
}

fn parameter_values(array: &ArrayStorage) -> Result<Vec<f32>> {
    match array.element_type() {
        ElementType::Float32 => Ok(array.as_slice::<f32>()?.to_vec()),
        ElementType::UInt16 => Ok(array.as_slice::<u16>()?.iter().map(|&v| f32::from(v)).collect()),
        ElementType::UInt8 => Ok(array.as_slice::<u8>()?.iter().map(|&v| f32::from(v)).collect()),
        other => Err(RecDbError::TypeMismatch {
            expected: ElementType::Float32,
            actual: other,
        }),
    }
}

fn parameter_matrix(array: &ArrayStorage, name: &str) -> Result<[[f32; 3]; 3]> {
    if array.shape().len() != 2 {
        return Err(RecDbError::SizeError(format!(
            "{name} must be 2-D, got shape {:?}",
            array.shape()
        )));
    }
    let values = parameter_values(array)?;
    if array.shape() != [3, 3] {
        return Err(RecDbError::SizeError(format!(
            "{name} must be 3x3, got shape {:?}",
            array.shape()
        )));
    }
    matrix3(&values)
}

/// Removes lens distortion from a gray image.
pub trait Undistorter {
    /// Returns the corrected image; it must keep the shape of `image`.
    fn undistort(&mut self, image: &GrayImage, model: &LensModel) -> Result<GrayImage>;
}

/// Pinhole camera with Brown-Conrady distortion, resampled bilinearly.
///
/// Output pixels whose source falls outside the image are black.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinholeUndistorter;

impl PinholeUndistorter {
    fn sample(image: &GrayImage, x: f64, y: f64) -> u8 {
        let (width, height) = (image.width() as f64, image.height() as f64);
        // Half-pixel border around the pixel centres.
        let inside = (-0.5..=width - 0.5).contains(&x) && (-0.5..=height - 0.5).contains(&y);
        if !inside {
            return 0;
        }
        let x = x.clamp(0.0, width - 1.0);
        let y = y.clamp(0.0, height - 1.0);
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let x1 = (x0 + 1).min(image.width() - 1);
        let y1 = (y0 + 1).min(image.height() - 1);
        let (fx, fy) = (x - x0 as f64, y - y0 as f64);

        let pixel = |row, col| f64::from(image.get(row, col).unwrap_or(0));
        let top = pixel(y0, x0) * (1.0 - fx) + pixel(y0, x1) * fx;
        let bottom = pixel(y1, x0) * (1.0 - fx) + pixel(y1, x1) * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }
}

impl Undistorter for PinholeUndistorter {
    fn undistort(&mut self, image: &GrayImage, model: &LensModel) -> Result<GrayImage> {
        model.check()?;
        let mut pixels = Vec::with_capacity(image.height() * image.width());
        for row in 0..image.height() {
            for col in 0..image.width() {
                let (x, y) = model.source_position(col as f64, row as f64);
                pixels.push(Self::sample(image, x, y));
            }
        }
        GrayImage::new(image.height(), image.width(), pixels)
    }
}

/// Publishes the undistorted first array of `camera` on `output`.
///
/// The camera array must be 2-D (uint8, uint16 or rgba32; see
/// [`to_gray8`]). Everything is computed before the transaction opens, so a
/// failure publishes nothing. Metadata of the camera recording is carried
/// over, plus the source channel and revisions.
///
/// # Errors
///
/// `SizeError`/`TypeMismatch` for unsupported inputs, errors from
/// [`LensModel::from_recording`] and from the undistorter, and transaction
/// errors on `output`.
pub fn apply_calibration<U: Undistorter + ?Sized>(
    db: &RecDatabase,
    camera: &Recording,
    calibration: &Recording,
    output: &Channel,
    undistorter: &mut U,
) -> Result<Arc<Recording>> {
    let model = LensModel::from_recording(calibration)?;
    let source = camera.array(0)?;
    if source.shape().len() != 2 {
        return Err(RecDbError::SizeError(format!(
            "undistortion needs a 2-D image, got shape {:?}",
            source.shape()
        )));
    }
    let gray = to_gray8(source)?;
    let corrected = undistorter.undistort(&gray, &model)?;
    if corrected.shape() != gray.shape() {
        return Err(RecDbError::SizeError(format!(
            "undistorter changed the image shape from {:?} to {:?}",
            gray.shape(),
            corrected.shape()
        )));
    }

    let mut txn = db.start_transaction();
    let recording = db.create_recording(&mut txn, output, ElementType::UInt8)?;
    db.end_transaction(txn)?;

    let mut metadata = camera.metadata().cloned().unwrap_or_default();
    metadata.insert("calibration-source_channel", camera.channel());
    metadata.insert("calibration-source_revision", camera.revision());
    metadata.insert("calibration-parameters_revision", calibration.revision());
    recording.set_metadata(metadata)?;
    recording.mark_metadata_done()?;
    let (height, width) = corrected.shape();
    recording.allocate_storage(0, &[height, width])?;
    recording
        .reference_ndarray(0)?
        .copy_from_slice(corrected.pixels())?;
    recording.mark_data_ready()?;
    debug!(
        "Undistorted {} revision {} onto {} revision {}",
        camera.channel(),
        camera.revision(),
        output.name(),
        recording.revision()
    );
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationConfig, CalibrationRecorder};
    use crate::recording::metadata::Metadata;

    const CENTRED: [[f32; 3]; 3] = [[2.0, 0.0, 1.5], [0.0, 2.0, 1.0], [0.0, 0.0, 1.0]];

    fn model(distortion: Vec<f32>) -> LensModel {
        LensModel {
            camera_matrix: CENTRED,
            distortion,
            new_camera_matrix: CENTRED,
        }
    }

    fn gradient(height: usize, width: usize) -> GrayImage {
        let pixels = (0..height * width).map(|i| (i * 10) as u8).collect();
        GrayImage::new(height, width, pixels).unwrap()
    }

    fn publish_u8(
        db: &RecDatabase,
        channel: &Channel,
        shape: &[usize],
        values: &[u8],
    ) -> Arc<Recording> {
        let mut txn = db.start_transaction();
        let rec = db
            .create_recording(&mut txn, channel, ElementType::UInt8)
            .unwrap();
        db.end_transaction(txn).unwrap();
        rec.set_metadata(Metadata::new().with("camera-fps", 30.0)).unwrap();
        rec.mark_metadata_done().unwrap();
        rec.allocate_storage(0, shape).unwrap();
        rec.reference_ndarray(0).unwrap().copy_from_slice(values).unwrap();
        rec.mark_data_ready().unwrap();
        rec
    }

    fn calibration_recording(
        db: &RecDatabase,
        mtx: ArrayStorage,
        dist: ArrayStorage,
    ) -> Arc<Recording> {
        let mut txn = db.start_transaction();
        let channel = db.define_channel(&mut txn, "/calib", "main").unwrap();
        let rec = db.create_multi_array_recording(&mut txn, &channel, 3).unwrap();
        rec.define_array(0, mtx.element_type(), "cam_mtx").unwrap();
        rec.define_array(1, dist.element_type(), "cam_dist").unwrap();
        rec.define_array(2, mtx.element_type(), "cam_newmtx").unwrap();
        db.end_transaction(txn).unwrap();
        rec.mark_metadata_done().unwrap();
        for (name, storage) in [("cam_mtx", &mtx), ("cam_dist", &dist), ("cam_newmtx", &mtx)] {
            rec.allocate_storage(name, storage.shape()).unwrap();
            rec.reference_ndarray(name)
                .unwrap()
                .as_bytes_mut()
                .unwrap()
                .copy_from_slice(storage.as_bytes());
        }
        rec.mark_data_ready().unwrap();
        rec
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let image = gradient(3, 4);
        let out = PinholeUndistorter.undistort(&image, &model(vec![0.0; 5])).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_barrel_distortion_samples_outward() {
        let lens = model(vec![0.5, 0.0, 0.0, 0.0, 0.0]);
        // The principal point is fixed.
        assert_eq!(lens.source_position(1.5, 1.0), (1.5, 1.0));
        let (x, y) = lens.source_position(3.5, 1.0);
        assert!(x > 3.5);
        assert!((y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pixels_mapped_outside_are_black() {
        let lens = model(vec![10.0, 0.0, 0.0, 0.0]);
        let out = PinholeUndistorter.undistort(&gradient(3, 4), &lens).unwrap();
        assert_eq!(out.get(0, 0), Some(0));
    }

    #[test]
    fn test_model_from_placeholder_calibration() {
        let db = RecDatabase::new();
        let recorder = CalibrationRecorder::new(&db, CalibrationConfig::default()).unwrap();
        let rec = recorder.channel().latest().unwrap();
        let lens = LensModel::from_recording(&rec).unwrap();
        assert_eq!(lens.camera_matrix, recorder.parameters().camera_matrix);
        assert_eq!(lens.distortion, vec![0.0; 5]);
    }

    #[test]
    fn test_model_accepts_integer_matrices() {
        let db = RecDatabase::new();
        let mtx = ArrayStorage::from_slice(&[3, 3], &[2u16, 0, 1, 0, 2, 1, 0, 0, 1]).unwrap();
        let dist = ArrayStorage::from_slice(&[1, 4], &[0u8; 4]).unwrap();
        let lens = LensModel::from_recording(&calibration_recording(&db, mtx, dist)).unwrap();
        assert_eq!(lens.new_camera_matrix[0], [2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_model_rejects_bad_parameters() {
        let db = RecDatabase::new();
        let dist = ArrayStorage::from_slice(&[5], &[0f32; 5]).unwrap();

        let wide = ArrayStorage::from_slice(&[3, 3], &[1f64; 9]).unwrap();
        assert!(matches!(
            LensModel::from_recording(&calibration_recording(&db, wide, dist.clone())),
            Err(RecDbError::TypeMismatch { actual: ElementType::Float64, .. })
        ));

        let flat = ArrayStorage::from_slice(&[9], &[1f32; 9]).unwrap();
        assert!(matches!(
            LensModel::from_recording(&calibration_recording(&db, flat, dist.clone())),
            Err(RecDbError::SizeError(_))
        ));

        let mtx = ArrayStorage::from_slice(&[3, 3], &[1f32; 9]).unwrap();
        let short = ArrayStorage::from_slice(&[3], &[0f32; 3]).unwrap();
        assert!(matches!(
            LensModel::from_recording(&calibration_recording(&db, mtx, short)),
            Err(RecDbError::SizeError(_))
        ));
    }

    #[test]
    fn test_apply_calibration_publishes_result() {
        let db = RecDatabase::new();
        let recorder = CalibrationRecorder::new(&db, CalibrationConfig::default()).unwrap();
        let mut txn = db.start_transaction();
        let camera_channel = db.define_channel(&mut txn, "/CAMERA0", "main").unwrap();
        let output = db.define_channel(&mut txn, "/CAMERA0/undistorted", "main").unwrap();
        db.end_transaction(txn).unwrap();

        let values: Vec<u8> = (0..9).collect();
        let camera = publish_u8(&db, &camera_channel, &[3, 3], &values);
        let calibration = recorder.channel().latest().unwrap();
        let out = apply_calibration(&db, &camera, &calibration, &output, &mut PinholeUndistorter)
            .unwrap();

        assert!(out.is_ready());
        let published = db
            .latest_globalrev()
            .get_recording_ref("/CAMERA0/undistorted")
            .unwrap();
        assert!(Arc::ptr_eq(&published, &out));
        assert_eq!(out.array(0).unwrap().shape(), &[3, 3]);
        // Placeholder parameters describe an undistorted lens.
        assert_eq!(out.data::<u8>(0).unwrap(), &values[..]);
        let metadata = out.metadata().unwrap();
        assert_eq!(metadata.get_str("calibration-source_channel"), Some("/CAMERA0"));
        assert_eq!(metadata.get_unsigned("calibration-source_revision"), Some(1));
        assert_eq!(metadata.get_dbl("camera-fps"), Some((30.0, "")));
    }

    #[test]
    fn test_apply_calibration_rejects_colour_frames() {
        let db = RecDatabase::new();
        let recorder = CalibrationRecorder::new(&db, CalibrationConfig::default()).unwrap();
        let mut txn = db.start_transaction();
        let camera_channel = db.define_channel(&mut txn, "/CAMERA0", "main").unwrap();
        let output = db.define_channel(&mut txn, "/out", "main").unwrap();
        db.end_transaction(txn).unwrap();

        let camera = publish_u8(&db, &camera_channel, &[2, 2, 3], &[7; 12]);
        let before = db.latest_globalrev();
        let calibration = recorder.channel().latest().unwrap();
        assert!(matches!(
            apply_calibration(&db, &camera, &calibration, &output, &mut PinholeUndistorter),
            Err(RecDbError::SizeError(_))
        ));
        assert!(db.latest_globalrev().ptr_eq(&before));
        assert!(output.latest().is_none());
    }
}
