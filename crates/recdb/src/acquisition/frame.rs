//! Raw frames and the frame-source seam.

use crate::error::{RecDbError, Result};
use crate::storage::{ArrayStorage, ElementType};

/// One raw frame as delivered by a [`FrameSource`].
///
/// Frames are `height x width` or `height x width x channels`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    storage: ArrayStorage,
}

impl Frame {
    /// Wraps a 2-D or 3-D array as a frame.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::SizeError` for any other rank.
    pub fn new(storage: ArrayStorage) -> Result<Self> {
        match storage.shape().len() {
            2 | 3 => Ok(Self { storage }),
            ndim => Err(RecDbError::SizeError(format!(
                "frame must be 2-D or 3-D, got {ndim} dimensions"
            ))),
        }
    }

    /// Builds an 8-bit frame; `channels == 1` yields a 2-D frame.
    pub fn from_u8(height: usize, width: usize, channels: usize, data: &[u8]) -> Result<Self> {
        let storage = if channels == 1 {
            ArrayStorage::from_slice(&[height, width], data)?
        } else {
            ArrayStorage::from_slice(&[height, width, channels], data)?
        };
        Self::new(storage)
    }

    /// Frame rows.
    pub fn height(&self) -> usize {
        self.storage.shape()[0]
    }

    /// Frame columns.
    pub fn width(&self) -> usize {
        self.storage.shape()[1]
    }

    /// Samples per pixel.
    pub fn channels(&self) -> usize {
        self.storage.shape().get(2).copied().unwrap_or(1)
    }

    /// Sample type.
    pub fn element_type(&self) -> ElementType {
        self.storage.element_type()
    }

    /// Underlying samples.
    pub fn storage(&self) -> &ArrayStorage {
        &self.storage
    }

    /// Per-pixel mean over the channel axis, truncated to 8 bits.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::TypeMismatch` for frames that are not uint8.
    pub fn channel_mean(&self) -> Result<Vec<u8>> {
        let samples = self.storage.as_slice::<u8>()?;
        let channels = self.channels();
        if channels == 1 {
            return Ok(samples.to_vec());
        }
        Ok(samples
            .chunks_exact(channels)
            .map(|pixel| {
                let sum: u32 = pixel.iter().map(|&v| u32::from(v)).sum();
                (sum / channels as u32) as u8
            })
            .collect())
    }
}

/// A device delivering frames and exposing numeric controls.
///
/// Control identifiers follow the usual capture-property numbering
/// (see [`CameraParameter`](super::CameraParameter)).
pub trait FrameSource: Send + 'static {
    /// Reads the next frame, blocking until one is available.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Reads a device control.
    fn get_control(&self, control_id: i32) -> Result<f64>;

    /// Writes a device control.
    fn set_control(&mut self, control_id: i32, value: f64) -> Result<()>;

    /// Releases the device once acquisition stops.
    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mean_truncates() {
        // Two BGR pixels.
        let frame = Frame::from_u8(1, 2, 3, &[1, 2, 4, 255, 255, 254]).unwrap();
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.channel_mean().unwrap(), vec![2, 254]);
    }

    #[test]
    fn test_single_channel_is_two_dimensional() {
        let frame = Frame::from_u8(2, 2, 1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(frame.storage().shape(), &[2, 2]);
        assert_eq!(frame.channel_mean().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rank_checked() {
        let storage = ArrayStorage::allocate(ElementType::UInt8, &[4]).unwrap();
        assert!(matches!(Frame::new(storage), Err(RecDbError::SizeError(_))));
    }

    #[test]
    fn test_mean_requires_u8() {
        let storage = ArrayStorage::allocate(ElementType::UInt16, &[2, 2]).unwrap();
        let frame = Frame::new(storage).unwrap();
        assert!(matches!(
            frame.channel_mean(),
            Err(RecDbError::TypeMismatch { .. })
        ));
    }
}
