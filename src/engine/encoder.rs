//! Face descriptor extraction
//!
//! Aligns every landmark set to a canonical chip, optionally jitters it,
//! and runs the descriptor network over all chips in fixed-size batches.

use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::image::Image;
use super::landmarks::FaceLandmarks;
use super::preprocess::{chips_to_nchw, extract_face_chip, jitter_chip};
use super::registry::OpenVinoNetwork;
use crate::config::EncodingConfig;
use crate::encoding::{FaceEncoding, ENCODING_DIM};
use crate::error::{FaceError, Result};
use crate::utils::math::mean_vector;

/// A callable that maps aligned chips to descriptors.
pub trait DescriptorNetwork: Send {
    /// One descriptor per chip, same order
    fn compute(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>>;
}

/// Descriptor network executed by OpenVINO
pub struct OpenVinoDescriptor {
    network: OpenVinoNetwork,
}

impl OpenVinoDescriptor {
    pub fn new(network: OpenVinoNetwork) -> Self {
        Self { network }
    }
}

impl DescriptorNetwork for OpenVinoDescriptor {
    fn compute(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        if chips.is_empty() {
            return Ok(Vec::new());
        }

        let tensor = chips_to_nchw(chips);
        let outputs = self.network.infer(&tensor)?;
        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| FaceError::Inference("descriptor network has no output".into()))?;

        if output.len() != chips.len() * ENCODING_DIM {
            return Err(FaceError::Inference(format!(
                "{} returned {} values for {} chips",
                self.network.name(),
                output.len(),
                chips.len()
            )));
        }

        Ok(output.chunks_exact(ENCODING_DIM).map(|c| c.to_vec()).collect())
    }
}

/// Turns landmark sets into face encodings.
pub struct Encoder {
    network: Box<dyn DescriptorNetwork>,
    rng: StdRng,
    batch_size: usize,
    chip_size: u32,
    padding: f64,
}

impl Encoder {
    pub fn new(network: Box<dyn DescriptorNetwork>, config: &EncodingConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(FaceError::InvalidArgument("encoding batch_size must be positive".into()));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            network,
            rng,
            batch_size: config.batch_size,
            chip_size: config.chip_size,
            padding: config.padding,
        })
    }

    /// Aligned chip for one landmark set
    pub fn face_chip(&self, image: &Image, landmarks: &FaceLandmarks) -> Result<RgbImage> {
        check_count(0, landmarks)?;
        extract_face_chip(&image.to_rgb8(), &landmarks.positions(), self.chip_size, self.padding)
    }

    /// One encoding per landmark set, in input order.
    ///
    /// `jitters <= 1` runs the aligned chip once; otherwise `jitters` random
    /// perturbations are encoded and averaged component-wise.
    pub fn encode(
        &mut self,
        image: &Image,
        landmarks: &[FaceLandmarks],
        jitters: u32,
    ) -> Result<Vec<FaceEncoding>> {
        let mut all = self.encode_batch(&[(image, landmarks)], jitters)?;
        Ok(all.pop().unwrap_or_default())
    }

    /// Encode faces from many images with one flat stream of network calls.
    ///
    /// Every landmark set is validated before any chip is computed.
    pub fn encode_batch(
        &mut self,
        items: &[(&Image, &[FaceLandmarks])],
        jitters: u32,
    ) -> Result<Vec<Vec<FaceEncoding>>> {
        let mut index = 0;
        for (_, sets) in items {
            for landmarks in sets.iter() {
                check_count(index, landmarks)?;
                index += 1;
            }
        }

        let copies = jitters.max(1) as usize;
        let mut chips = Vec::with_capacity(index * copies);
        for (image, sets) in items {
            if sets.is_empty() {
                continue;
            }
            let rgb = image.to_rgb8();
            for landmarks in sets.iter() {
                let chip = extract_face_chip(&rgb, &landmarks.positions(), self.chip_size, self.padding)?;
                if jitters <= 1 {
                    chips.push(chip);
                } else {
                    for _ in 0..jitters {
                        chips.push(jitter_chip(&chip, &mut self.rng));
                    }
                }
            }
        }

        let descriptors = self.run_network(&chips)?;

        let mut per_face = descriptors.chunks(copies).map(|group| {
            let values: Vec<Vec<f64>> = group
                .iter()
                .map(|d| d.iter().map(|&v| v as f64).collect())
                .collect();
            FaceEncoding::from_descriptor(mean_vector(&values))
        });

        let results: Vec<Vec<FaceEncoding>> = items
            .iter()
            .map(|(_, sets)| per_face.by_ref().take(sets.len()).collect())
            .collect();

        debug!("Encoded {} faces with {} jitters", index, jitters);
        Ok(results)
    }

    fn run_network(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        let mut descriptors = Vec::with_capacity(chips.len());
        for batch in chips.chunks(self.batch_size) {
            let out = self.network.compute(batch)?;
            if out.len() != batch.len() {
                return Err(FaceError::Inference(format!(
                    "descriptor network returned {} results for {} chips",
                    out.len(),
                    batch.len()
                )));
            }
            descriptors.extend(out);
        }
        Ok(descriptors)
    }
}

fn check_count(index: usize, landmarks: &FaceLandmarks) -> Result<()> {
    match landmarks.len() {
        68 | 5 => Ok(()),
        count => Err(FaceError::InvalidLandmarkCount { index, count }),
    }
}
