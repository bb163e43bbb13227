//! Owned image handle consumed by every pipeline stage

use std::path::Path;

use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, RgbImage};
use serde::{Deserialize, Serialize};

use super::preprocess;
use crate::error::{FaceError, Result};
use crate::geometry::Location;

/// Pixel layout of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Rgb,
    Grayscale,
}

impl Mode {
    pub fn channels(self) -> usize {
        match self {
            Mode::Rgb => 3,
            Mode::Grayscale => 1,
        }
    }
}

/// An immutable 8-bit image in RGB or grayscale.
#[derive(Debug, Clone)]
pub struct Image {
    inner: DynamicImage,
    mode: Mode,
}

impl Image {
    /// Wrap a tightly packed buffer. `bytes.len()` must equal `width * height * channels`.
    pub fn from_raw(bytes: &[u8], width: u32, height: u32, mode: Mode) -> Result<Self> {
        let expected = width as usize * height as usize * mode.channels();
        if bytes.len() != expected {
            return Err(FaceError::InvalidImageBuffer {
                expected,
                actual: bytes.len(),
            });
        }
        Self::from_packed(bytes.to_vec(), width, height, mode)
    }

    /// Wrap a buffer whose rows are `stride` bytes apart.
    pub fn from_raw_with_stride(
        bytes: &[u8],
        rows: u32,
        columns: u32,
        stride: usize,
        mode: Mode,
    ) -> Result<Self> {
        let row_bytes = columns as usize * mode.channels();
        if stride < row_bytes {
            return Err(FaceError::InvalidArgument(format!(
                "stride {stride} is smaller than a row of {row_bytes} bytes"
            )));
        }
        let expected = rows as usize * stride;
        if bytes.len() < expected {
            return Err(FaceError::InvalidImageBuffer {
                expected,
                actual: bytes.len(),
            });
        }

        let mut packed = Vec::with_capacity(rows as usize * row_bytes);
        for row in bytes.chunks(stride).take(rows as usize) {
            packed.extend_from_slice(&row[..row_bytes]);
        }
        Self::from_packed(packed, columns, rows, mode)
    }

    /// Decode an encoded image (JPEG, PNG, ...) honouring EXIF orientation
    pub fn decode(bytes: &[u8], mode: Mode) -> Result<Self> {
        let decoded = preprocess::decode_image(bytes)?;
        Ok(Self::from_dynamic(decoded, mode))
    }

    pub fn load_file(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::decode(&bytes, mode)
    }

    /// Convert any decoded image into the requested mode
    pub fn from_dynamic(image: DynamicImage, mode: Mode) -> Self {
        let inner = match mode {
            Mode::Rgb => DynamicImage::ImageRgb8(image.to_rgb8()),
            Mode::Grayscale => DynamicImage::ImageLuma8(image.to_luma8()),
        };
        Self { inner, mode }
    }

    fn from_packed(packed: Vec<u8>, width: u32, height: u32, mode: Mode) -> Result<Self> {
        let actual = packed.len();
        let invalid = || FaceError::InvalidImageBuffer {
            expected: width as usize * height as usize * mode.channels(),
            actual,
        };
        let inner = match mode {
            Mode::Rgb => DynamicImage::ImageRgb8(
                ImageBuffer::from_raw(width, height, packed).ok_or_else(invalid)?,
            ),
            Mode::Grayscale => DynamicImage::ImageLuma8(
                ImageBuffer::from_raw(width, height, packed).ok_or_else(invalid)?,
            ),
        };
        Ok(Self { inner, mode })
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.inner
    }

    /// RGB view; grayscale is promoted by channel replication
    pub fn to_rgb8(&self) -> RgbImage {
        self.inner.to_rgb8()
    }

    pub fn to_luma8(&self) -> GrayImage {
        self.inner.to_luma8()
    }

    /// Same image at twice the width and height
    pub fn upsample(&self) -> Image {
        Self {
            inner: preprocess::pyramid_up(&self.inner),
            mode: self.mode,
        }
    }

    /// Copy of the region under `location`, clamped to the image.
    ///
    /// Returns `None` when the location lies entirely outside.
    pub fn crop(&self, location: &Location) -> Option<Image> {
        let trimmed = location.trim(self.width(), self.height())?;
        Some(Self {
            inner: preprocess::crop(&self.inner, &trimmed),
            mode: self.mode,
        })
    }
}
