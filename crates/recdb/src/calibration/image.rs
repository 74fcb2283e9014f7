//! 8-bit grayscale images for pattern detection.

use crate::error::{RecDbError, Result};
use crate::storage::{ArrayStorage, ElementType, Rgba32};

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Row-major 8-bit grayscale image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    height: usize,
    width: usize,
    pixels: Vec<u8>,
}

impl GrayImage {
    /// Wraps `pixels` as a `height x width` image.
    ///
    /// # Errors
    ///
    /// Returns `RecDbError::SizeError` if the pixel count does not match.
    pub fn new(height: usize, width: usize, pixels: Vec<u8>) -> Result<Self> {
        if height.checked_mul(width) != Some(pixels.len()) {
            return Err(RecDbError::SizeError(format!(
                "{} pixels for a {height}x{width} image",
                pixels.len()
            )));
        }
        Ok(Self {
            height,
            width,
            pixels,
        })
    }

    /// Rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Pixel at `row`, `col`.
    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        if row < self.height && col < self.width {
            self.pixels.get(row * self.width + col).copied()
        } else {
            None
        }
    }

    /// All pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (f32::from(r) * LUMA_R + f32::from(g) * LUMA_G + f32::from(b) * LUMA_B) as u8
}

fn dims2(storage: &ArrayStorage) -> Result<(usize, usize)> {
    match storage.shape() {
        [height, width] => Ok((*height, *width)),
        shape => Err(RecDbError::SizeError(format!(
            "expected a 2-D {} image, got shape {shape:?}",
            storage.element_type()
        ))),
    }
}

/// Converts a camera array to 8-bit gray.
///
/// - rgba32 `[h, w]`: luma from red, green and blue
/// - uint16 `[h, w]`: value / 256
/// - uint8 `[h, w, c]` with `c >= 3`: luma of BGR-ordered samples
/// - uint8 `[h, w]`: unchanged
///
/// # Errors
///
/// `TypeMismatch` for other element types; `SizeError` for other shapes.
pub fn to_gray8(storage: &ArrayStorage) -> Result<GrayImage> {
    match storage.element_type() {
        ElementType::Rgba32 => {
            let (height, width) = dims2(storage)?;
            let pixels = storage
                .as_slice::<Rgba32>()?
                .iter()
                .map(|px| luma(px.r, px.g, px.b))
                .collect();
            GrayImage::new(height, width, pixels)
        }
        ElementType::UInt16 => {
            let (height, width) = dims2(storage)?;
            let pixels = storage
                .as_slice::<u16>()?
                .iter()
                .map(|&v| (v / 256) as u8)
                .collect();
            GrayImage::new(height, width, pixels)
        }
        ElementType::UInt8 => match storage.shape() {
            &[height, width] => GrayImage::new(height, width, storage.as_slice::<u8>()?.to_vec()),
            &[height, width, channels] if channels >= 3 => {
                let pixels = storage
                    .as_slice::<u8>()?
                    .chunks_exact(channels)
                    .map(|px| luma(px[2], px[1], px[0]))
                    .collect();
                GrayImage::new(height, width, pixels)
            }
            shape => Err(RecDbError::SizeError(format!(
                "cannot convert uint8 image of shape {shape:?} to gray"
            ))),
        },
        other => Err(RecDbError::TypeMismatch {
            expected: ElementType::UInt8,
            actual: other,
        }),
    }
}
