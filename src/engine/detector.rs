//! Face detection
//!
//! Two interchangeable locators sit behind [`FaceLocator`]: the SeetaFace
//! cascade for speed and an SCRFD-style network for accuracy. [`Detector`]
//! owns both and adds the up-sampling pyramid, the mapping back to input
//! pixels and clamping.

use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::image::Image;
use super::preprocess::{detection_tensor, pad_to_multiple, DETECTOR_STRIDE_ALIGN};
use super::registry::OpenVinoNetwork;
use crate::config::DetectionConfig;
use crate::error::{FaceError, Result};
use crate::geometry::Location;

/// Detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionModel {
    /// SeetaFace funnel cascade
    Fast,
    /// Anchor-based network run through OpenVINO
    Accurate,
}

/// A face box in the pixel space of the image given to the locator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: Option<f32>,
}

impl RawDetection {
    fn score(&self) -> f32 {
        self.confidence.unwrap_or(0.0)
    }
}

/// A callable bounding-box face locator.
pub trait FaceLocator: Send {
    fn locate(&mut self, image: &Image) -> Result<Vec<RawDetection>>;

    /// Locate faces in equally sized images.
    ///
    /// The default runs [`FaceLocator::locate`] once per image; network
    /// locators override it with a single batched call.
    fn locate_batch(&mut self, images: &[Image]) -> Result<Vec<Vec<RawDetection>>> {
        images.iter().map(|image| self.locate(image)).collect()
    }
}

/// SeetaFace frontal detector
pub struct SeetaLocator {
    model: rustface::Model,
    min_face_size: u32,
    score_threshold: f64,
}

// rustface::Model holds boxed classifiers without a Send bound; the model is
// only read, and a fresh detector is built per call.
unsafe impl Send for SeetaLocator {}

/// Smallest face size the SeetaFace cascade accepts
pub const SEETA_MIN_FACE_SIZE: u32 = 20;

impl SeetaLocator {
    /// Reject settings the cascade cannot run with
    pub fn check_config(config: &DetectionConfig) -> Result<()> {
        if config.min_face_size < SEETA_MIN_FACE_SIZE {
            return Err(FaceError::InvalidArgument(format!(
                "min_face_size must be at least {}, got {}",
                SEETA_MIN_FACE_SIZE, config.min_face_size
            )));
        }
        if config.score_threshold.is_nan() || config.score_threshold <= 0.0 {
            return Err(FaceError::InvalidArgument(format!(
                "score_threshold must be positive, got {}",
                config.score_threshold
            )));
        }
        Ok(())
    }

    pub fn load(path: &Path, config: &DetectionConfig) -> Result<Self> {
        Self::check_config(config)?;
        info!("Loading model: {}", path.display());
        let start = Instant::now();

        let file = std::fs::File::open(path)?;
        let model = rustface::read_model(std::io::BufReader::new(file))
            .map_err(|e| FaceError::InvalidModel(format!("{}: {}", path.display(), e)))?;

        info!("Model {} loaded in {:?}", path.display(), start.elapsed());
        Ok(Self {
            model,
            min_face_size: config.min_face_size,
            score_threshold: config.score_threshold,
        })
    }
}

impl FaceLocator for SeetaLocator {
    fn locate(&mut self, image: &Image) -> Result<Vec<RawDetection>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.min_face_size);
        detector.set_score_thresh(self.score_threshold);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        let gray = image.to_luma8();
        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), gray.width(), gray.height()));

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                RawDetection {
                    x1: bbox.x() as f32,
                    y1: bbox.y() as f32,
                    x2: (bbox.x() + bbox.width() as i32) as f32,
                    y2: (bbox.y() + bbox.height() as i32) as f32,
                    confidence: Some(face.score() as f32),
                }
            })
            .collect())
    }
}

/// SCRFD-style network locator.
pub struct CnnLocator {
    network: OpenVinoNetwork,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl CnnLocator {
    pub fn new(network: OpenVinoNetwork, config: &DetectionConfig) -> Self {
        Self {
            network,
            confidence_threshold: config.confidence_threshold,
            nms_threshold: config.nms_threshold,
        }
    }
}

impl FaceLocator for CnnLocator {
    fn locate(&mut self, image: &Image) -> Result<Vec<RawDetection>> {
        let mut all = self.locate_batch(std::slice::from_ref(image))?;
        Ok(all.pop().unwrap_or_default())
    }

    fn locate_batch(&mut self, images: &[Image]) -> Result<Vec<Vec<RawDetection>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let padded: Vec<_> = images
            .iter()
            .map(|image| pad_to_multiple(&image.to_rgb8(), DETECTOR_STRIDE_ALIGN))
            .collect();
        let (width, height) = padded[0].dimensions();
        let tensor = detection_tensor(&padded)?;

        let outputs = self.network.infer(&tensor)?;
        let n = images.len();

        let mut results = Vec::with_capacity(n);
        for i in 0..n {
            let per_image: Vec<&[f32]> = outputs
                .iter()
                .map(|output| {
                    let chunk = output.len() / n;
                    &output[i * chunk..(i + 1) * chunk]
                })
                .collect();
            let boxes = decode_scrfd(&per_image, width, height, self.confidence_threshold);
            results.push(nms(boxes, self.nms_threshold));
        }

        Ok(results)
    }
}

/// Decode SCRFD outputs for one image.
///
/// `outputs` holds scores for every stride, then box distances, then
/// (optionally) keypoints; the output count selects the layout.
pub fn decode_scrfd(outputs: &[&[f32]], width: u32, height: u32, threshold: f32) -> Vec<RawDetection> {
    let (fmc, num_anchors) = match outputs.len() {
        6 | 9 => (3, 2),
        10 | 15 => (5, 1),
        count => {
            warn!("Unknown SCRFD output count: {}, trying default", count);
            (3, 2)
        }
    };
    if outputs.len() < fmc * 2 {
        return Vec::new();
    }

    let strides: &[u32] = if fmc == 3 { &[8, 16, 32] } else { &[8, 16, 32, 64, 128] };
    let mut boxes = Vec::new();

    for (idx, &stride) in strides.iter().enumerate() {
        let scores = outputs[idx];
        let bboxes = outputs[idx + fmc];
        let feat_w = width / stride;
        let feat_h = height / stride;
        let s = stride as f32;

        let mut i = 0usize;
        for y in 0..feat_h {
            for x in 0..feat_w {
                let (cx, cy) = (x as f32 * s, y as f32 * s);
                for _ in 0..num_anchors {
                    let anchor = i;
                    i += 1;

                    let Some(&score) = scores.get(anchor) else {
                        continue;
                    };
                    if score < threshold || anchor * 4 + 3 >= bboxes.len() {
                        continue;
                    }

                    let d = &bboxes[anchor * 4..anchor * 4 + 4];
                    boxes.push(RawDetection {
                        x1: cx - d[0] * s,
                        y1: cy - d[1] * s,
                        x2: cx + d[2] * s,
                        y2: cy + d[3] * s,
                        confidence: Some(score),
                    });
                }
            }
        }
    }

    debug!("Decoded {} candidate boxes", boxes.len());
    boxes
}

/// Non-maximum suppression
pub fn nms(mut boxes: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    boxes.sort_by(|a, b| b.score().total_cmp(&a.score()));

    let mut keep: Vec<RawDetection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i]);

        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && compute_iou(&boxes[i], &boxes[j]) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute intersection over union
fn compute_iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Map raw boxes found after `upsample` doublings back to the original image.
fn to_locations(raw: &[RawDetection], upsample: u32, width: u32, height: u32) -> Vec<Location> {
    let scale = (1u64 << upsample) as f64;
    raw.iter()
        .filter_map(|d| {
            let location = Location {
                left: (d.x1 as f64 / scale).round() as i32,
                top: (d.y1 as f64 / scale).round() as i32,
                right: (d.x2 as f64 / scale).round() as i32,
                bottom: (d.y2 as f64 / scale).round() as i32,
                confidence: d.confidence.map(f64::from),
            };
            location.trim(width, height)
        })
        .collect()
}

fn upsampled(image: &Image, upsample: u32) -> Cow<'_, Image> {
    let mut working = Cow::Borrowed(image);
    for _ in 0..upsample {
        working = Cow::Owned(working.upsample());
    }
    working
}

/// Up-sampling detector over both strategies.
pub struct Detector {
    fast: Box<dyn FaceLocator>,
    accurate: Box<dyn FaceLocator>,
}

impl Detector {
    pub fn new(fast: Box<dyn FaceLocator>, accurate: Box<dyn FaceLocator>) -> Self {
        Self { fast, accurate }
    }

    fn locator(&mut self, model: DetectionModel) -> &mut dyn FaceLocator {
        match model {
            DetectionModel::Fast => self.fast.as_mut(),
            DetectionModel::Accurate => self.accurate.as_mut(),
        }
    }

    /// Face boxes in `image`, clamped to its bounds.
    ///
    /// The image is doubled `upsample` times before detection and every box
    /// is divided by `2^upsample` and rounded on the way back.
    pub fn face_locations(
        &mut self,
        image: &Image,
        upsample: u32,
        model: DetectionModel,
    ) -> Result<Vec<Location>> {
        if image.width() == 0 || image.height() == 0 {
            debug!("Empty image, skipping detection");
            return Ok(Vec::new());
        }

        let working = upsampled(image, upsample);
        let raw = self.locator(model).locate(&working)?;
        let locations = to_locations(&raw, upsample, image.width(), image.height());

        debug!("Detected {} faces with {:?} (upsample {})", locations.len(), model, upsample);
        Ok(locations)
    }

    /// Face boxes for many equally sized images using the accurate locator.
    ///
    /// Dimensions are validated before any network call; images are sent to
    /// the network `batch_size` at a time.
    pub fn batch_face_locations(
        &mut self,
        images: &[Image],
        upsample: u32,
        batch_size: usize,
    ) -> Result<Vec<Vec<Location>>> {
        if batch_size == 0 {
            return Err(FaceError::InvalidArgument("batch_size must be positive".into()));
        }
        let Some(first) = images.first() else {
            return Ok(Vec::new());
        };

        let expected = first.dimensions();
        for (index, image) in images.iter().enumerate() {
            if image.dimensions() != expected {
                return Err(FaceError::BatchDimensionMismatch {
                    index,
                    expected,
                    actual: image.dimensions(),
                });
            }
        }

        let (width, height) = expected;
        if width == 0 || height == 0 {
            return Ok(vec![Vec::new(); images.len()]);
        }

        let mut results = Vec::with_capacity(images.len());
        for chunk in images.chunks(batch_size) {
            let working: Vec<Image> = chunk
                .iter()
                .map(|image| upsampled(image, upsample).into_owned())
                .collect();
            let raw = self.accurate.locate_batch(&working)?;
            if raw.len() != chunk.len() {
                return Err(FaceError::Inference(format!(
                    "locator returned {} results for {} images",
                    raw.len(),
                    chunk.len()
                )));
            }
            results.extend(raw.iter().map(|r| to_locations(r, upsample, width, height)));
        }

        info!("Batch detection over {} images in chunks of {}", images.len(), batch_size);
        Ok(results)
    }
}
