#![allow(dead_code)]

//! In-process stand-ins for the model files, so the whole pipeline runs
//! without OpenVINO or dlib data.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use facerec::config::Config;
use facerec::engine::{AttributeNetwork, DescriptorNetwork, FaceLocator, LandmarkPredictor, RawDetection};
use facerec::error::Result;
use facerec::{FaceRecognition, Image, Location, Mode, ModelRegistry, ENCODING_DIM};
use image::{GrayImage, RgbImage};
use ndarray::Array4;

/// Boxes given as fractions of the image handed to the locator, so they
/// scale with up-sampling.
pub struct FractionLocator {
    pub boxes: Vec<[f32; 4]>,
    pub calls: Arc<AtomicUsize>,
}

impl FractionLocator {
    fn boxes_for(&self, image: &Image) -> Vec<RawDetection> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        self.boxes
            .iter()
            .map(|b| RawDetection {
                x1: b[0] * w,
                y1: b[1] * h,
                x2: b[2] * w,
                y2: b[3] * h,
                confidence: Some(0.99),
            })
            .collect()
    }
}

impl FaceLocator for FractionLocator {
    fn locate(&mut self, image: &Image) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.boxes_for(image))
    }

    fn locate_batch(&mut self, images: &[Image]) -> Result<Vec<Vec<RawDetection>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(images.iter().map(|image| self.boxes_for(image)).collect())
    }
}

/// Places a fixed point layout inside every face rectangle.
pub struct LayoutPredictor {
    pub parts: usize,
}

// Two eye corners each plus the nose, in 5 point predictor order
const FIVE_POINT_LAYOUT: [(f64, f64); 5] = [(0.75, 0.35), (0.6, 0.35), (0.25, 0.35), (0.4, 0.35), (0.5, 0.65)];

impl LandmarkPredictor for LayoutPredictor {
    fn num_parts(&self) -> usize {
        self.parts
    }

    fn predict(&self, _image: &GrayImage, location: &Location) -> Vec<(f64, f64)> {
        let (left, top) = (location.left as f64, location.top as f64);
        let (w, h) = (location.width() as f64, location.height() as f64);
        if self.parts == 5 {
            return FIVE_POINT_LAYOUT
                .iter()
                .map(|&(fx, fy)| (left + fx * w, top + fy * h))
                .collect();
        }
        (0..self.parts)
            .map(|i| {
                let fx = ((i % 9) as f64 + 0.5) / 9.0;
                let fy = ((i / 9) as f64 + 0.5) / (self.parts / 9 + 1) as f64;
                (left + fx * w, top + fy * h)
            })
            .collect()
    }
}

/// Descriptor built from mean intensities of horizontal bands in the
/// central half of the chip.
pub struct BandNetwork {
    pub calls: Arc<AtomicUsize>,
    pub chips: Arc<AtomicUsize>,
}

impl DescriptorNetwork for BandNetwork {
    fn compute(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.chips.fetch_add(chips.len(), Ordering::SeqCst);
        Ok(chips.iter().map(band_descriptor).collect())
    }
}

fn band_descriptor(chip: &RgbImage) -> Vec<f32> {
    let (w, h) = chip.dimensions();
    let (x0, x1) = (w / 4, 3 * w / 4);
    let (y0, y1) = (h / 4, 3 * h / 4);
    (0..ENCODING_DIM)
        .map(|i| {
            let y = y0 + (i as u32 * (y1 - y0)) / ENCODING_DIM as u32;
            let sum: u32 = (x0..x1).map(|x| chip.get_pixel(x, y)[0] as u32).sum();
            sum as f32 / (x1 - x0) as f32 / 255.0
        })
        .collect()
}

/// Classifier that answers every input with the same scores
pub struct FixedScores {
    pub scores: Vec<f32>,
    pub calls: Arc<AtomicUsize>,
}

impl AttributeNetwork for FixedScores {
    fn classify(&mut self, _input: &Array4<f32>) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.scores.clone())
    }
}

#[derive(Clone, Default)]
pub struct Counters {
    pub fast_calls: Arc<AtomicUsize>,
    pub accurate_calls: Arc<AtomicUsize>,
    pub network_calls: Arc<AtomicUsize>,
    pub network_chips: Arc<AtomicUsize>,
}

impl Counters {
    pub fn get(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn registry(boxes: Vec<[f32; 4]>) -> (ModelRegistry, Counters) {
    let counters = Counters::default();
    let registry = ModelRegistry {
        fast_locator: Box::new(FractionLocator {
            boxes: boxes.clone(),
            calls: counters.fast_calls.clone(),
        }),
        accurate_locator: Box::new(FractionLocator {
            boxes,
            calls: counters.accurate_calls.clone(),
        }),
        large_predictor: Box::new(LayoutPredictor { parts: 68 }),
        small_predictor: Box::new(LayoutPredictor { parts: 5 }),
        helen_predictor: None,
        descriptor: Box::new(BandNetwork {
            calls: counters.network_calls.clone(),
            chips: counters.network_chips.clone(),
        }),
        age_estimator: None,
        gender_estimator: None,
        emotion_estimator: None,
        head_pose_estimator: None,
    };
    (registry, counters)
}

pub fn recognition(boxes: Vec<[f32; 4]>) -> (FaceRecognition, Counters) {
    let mut config = Config::default();
    config.encoding.seed = Some(42);
    recognition_with(boxes, config)
}

pub fn recognition_with(boxes: Vec<[f32; 4]>, config: Config) -> (FaceRecognition, Counters) {
    let (registry, counters) = registry(boxes);
    let faces = FaceRecognition::from_registry(registry, config).expect("build pipeline");
    (faces, counters)
}

/// RGB image whose red channel grows downwards and green rightwards
pub fn gradient_image(width: u32, height: u32, offset: u8) -> Image {
    let mut bytes = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            bytes.push(((y * 255) / height) as u8);
            bytes.push(((x * 255) / width) as u8);
            bytes.push(offset);
        }
    }
    Image::from_raw(&bytes, width, height, Mode::Rgb).expect("valid buffer")
}

/// Same gradient but red grows rightwards
pub fn transposed_image(width: u32, height: u32) -> Image {
    let mut bytes = Vec::with_capacity((width * height * 3) as usize);
    for _y in 0..height {
        for x in 0..width {
            bytes.push(((x * 255) / width) as u8);
            bytes.push(0);
            bytes.push(0);
        }
    }
    Image::from_raw(&bytes, width, height, Mode::Rgb).expect("valid buffer")
}
