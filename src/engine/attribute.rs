//! Face attribute estimation
//!
//! Age group, gender and emotion are classified from a square crop of the
//! face rectangle. Head pose is regressed from the 68 point landmarks.

use std::collections::BTreeMap;
use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::image::Image;
use super::landmarks::FacePartMap;
use super::registry::OpenVinoNetwork;
use crate::error::{FaceError, Result};
use crate::geometry::{FacePoint, Location};
use crate::utils::math::squared_distance;

/// Side of the square crop fed to the attribute networks
pub const ATTRIBUTE_INPUT_SIZE: u32 = 227;

/// Gender classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

/// Gender network output order
pub const GENDER_LABELS: [Gender; 2] = [Gender::Male, Gender::Female];

/// Inclusive age span of one age class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub start: u32,
    pub end: u32,
}

impl AgeRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

/// Age classes in network output order; a predicted age is an index here
pub const AGE_GROUPS: [AgeRange; 8] = [
    AgeRange::new(0, 2),
    AgeRange::new(4, 6),
    AgeRange::new(8, 13),
    AgeRange::new(15, 20),
    AgeRange::new(25, 32),
    AgeRange::new(38, 43),
    AgeRange::new(48, 53),
    AgeRange::new(60, 100),
];

/// FER+ emotion classes in output order
pub const EMOTION_LABELS: [&str; 8] = [
    "neutral", "happy", "surprise", "sad", "angry", "disgust", "fear", "contempt",
];

/// A network that maps one NCHW input to raw class scores.
pub trait AttributeNetwork: Send {
    fn classify(&mut self, input: &Array4<f32>) -> Result<Vec<f32>>;
}

/// Classifier executed by OpenVINO; the first output holds the scores
pub struct OpenVinoClassifier {
    network: OpenVinoNetwork,
}

impl OpenVinoClassifier {
    pub fn new(network: OpenVinoNetwork) -> Self {
        Self { network }
    }
}

impl AttributeNetwork for OpenVinoClassifier {
    fn classify(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
        let name = self.network.name().to_string();
        self.network
            .infer(input)?
            .into_iter()
            .next()
            .ok_or_else(|| FaceError::Inference(format!("{} has no output", name)))
    }
}

/// Estimates one attribute of the face under a location.
///
/// Implementations supply the label set and the class probabilities; the
/// label and map forms are derived from those.
pub trait AttributeEstimator: Send {
    type Label: Clone + Ord;

    fn labels(&self) -> &[Self::Label];

    /// One probability per label, in label order
    fn probabilities(&mut self, image: &Image, location: &Location) -> Result<Vec<f32>>;

    /// Most probable label; ties go to the earlier label
    fn predict(&mut self, image: &Image, location: &Location) -> Result<Self::Label> {
        let probabilities = self.probabilities(image, location)?;
        let best = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(index, _)| index);
        best.and_then(|index| self.labels().get(index).cloned())
            .ok_or_else(|| FaceError::Inference("classifier produced no scores".into()))
    }

    fn predict_probability(&mut self, image: &Image, location: &Location) -> Result<BTreeMap<Self::Label, f32>> {
        let probabilities = self.probabilities(image, location)?;
        let labels = self.labels();
        if probabilities.len() != labels.len() {
            return Err(FaceError::Inference(format!(
                "{} probabilities for {} labels",
                probabilities.len(),
                labels.len()
            )));
        }
        Ok(labels.iter().cloned().zip(probabilities).collect())
    }
}

pub type AgeEstimator = dyn AttributeEstimator<Label = u32>;
pub type GenderEstimator = dyn AttributeEstimator<Label = Gender>;
pub type EmotionEstimator = dyn AttributeEstimator<Label = String>;

/// Pixel layout expected by a classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Three channels scaled to `(x - 127.5) / 128`
    Rgb,
    /// One luminance channel of raw 0..255 values
    Grayscale,
}

/// Softmax classifier over a fixed-size crop of the face rectangle.
pub struct ClassifierEstimator<L> {
    network: Box<dyn AttributeNetwork>,
    labels: Vec<L>,
    input: InputKind,
    size: u32,
}

impl<L> ClassifierEstimator<L> {
    pub fn new(network: Box<dyn AttributeNetwork>, labels: Vec<L>, input: InputKind) -> Result<Self> {
        if labels.is_empty() {
            return Err(FaceError::InvalidArgument("classifier needs at least one label".into()));
        }
        Ok(Self::with_labels(network, labels, input))
    }

    fn with_labels(network: Box<dyn AttributeNetwork>, labels: Vec<L>, input: InputKind) -> Self {
        Self {
            network,
            labels,
            input,
            size: ATTRIBUTE_INPUT_SIZE,
        }
    }

    pub fn input(&self) -> InputKind {
        self.input
    }
}

impl ClassifierEstimator<u32> {
    /// Age group classifier; labels index [`AGE_GROUPS`]
    pub fn age(network: Box<dyn AttributeNetwork>) -> Self {
        let labels = (0..AGE_GROUPS.len() as u32).collect();
        Self::with_labels(network, labels, InputKind::Rgb)
    }
}

impl ClassifierEstimator<Gender> {
    pub fn gender(network: Box<dyn AttributeNetwork>) -> Self {
        Self::with_labels(network, GENDER_LABELS.to_vec(), InputKind::Rgb)
    }
}

impl ClassifierEstimator<String> {
    /// Emotion classifier over a grayscale crop, one label per network class
    pub fn emotion(network: Box<dyn AttributeNetwork>, labels: Vec<String>) -> Result<Self> {
        Self::new(network, labels, InputKind::Grayscale)
    }
}

impl<L: Clone + Ord + Send> AttributeEstimator for ClassifierEstimator<L> {
    type Label = L;

    fn labels(&self) -> &[L] {
        &self.labels
    }

    fn probabilities(&mut self, image: &Image, location: &Location) -> Result<Vec<f32>> {
        let face = image
            .crop(location)
            .ok_or_else(|| FaceError::InvalidArgument(format!("{:?} lies outside the image", location)))?;
        let resized = face
            .as_dynamic()
            .resize_exact(self.size, self.size, FilterType::Lanczos3);

        let tensor = match self.input {
            InputKind::Rgb => rgb_tensor(&resized),
            InputKind::Grayscale => gray_tensor(&resized),
        };
        let scores = self.network.classify(&tensor)?;
        if scores.len() != self.labels.len() {
            return Err(FaceError::Inference(format!(
                "classifier returned {} scores for {} labels",
                scores.len(),
                self.labels.len()
            )));
        }

        let probabilities = softmax(&scores);
        debug!("Attribute probabilities: {:?}", probabilities);
        Ok(probabilities)
    }
}

fn rgb_tensor(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }
    tensor
}

fn gray_tensor(image: &DynamicImage) -> Array4<f32> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 1, height as usize, width as usize));
    for (x, y, pixel) in gray.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32;
    }
    tensor
}

fn softmax(x: &[f32]) -> Vec<f32> {
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = x.iter().map(|v| (v - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|v| v / sum).collect()
}

/// Head orientation in the regressors' units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Estimates head pose from named face parts.
pub trait HeadPoseEstimator: Send {
    fn predict(&self, parts: &FacePartMap) -> Result<HeadPose>;
}

const POSE_POINTS: usize = 68;
const NOSE_TIP: usize = 33;
/// Every point but the nose tip contributes one feature
pub const POSE_FEATURE_LEN: usize = POSE_POINTS - 1;

/// Radial basis kernel regressor: `bias + Σ alpha_i · exp(-gamma · |x - basis_i|²)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRegressor {
    pub gamma: f64,
    pub basis: Vec<Vec<f64>>,
    pub alpha: Vec<f64>,
    pub bias: f64,
}

impl KernelRegressor {
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.basis
            .iter()
            .zip(self.alpha.iter())
            .map(|(b, a)| a * (-self.gamma * squared_distance(x, b)).exp())
            .sum::<f64>()
            + self.bias
    }

    fn check(&self, name: &str) -> Result<()> {
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(FaceError::InvalidModel(format!("{} regressor has gamma {}", name, self.gamma)));
        }
        if self.alpha.len() != self.basis.len() {
            return Err(FaceError::InvalidModel(format!(
                "{} regressor has {} weights for {} basis vectors",
                name,
                self.alpha.len(),
                self.basis.len()
            )));
        }
        if let Some(bad) = self.basis.iter().find(|b| b.len() != POSE_FEATURE_LEN) {
            return Err(FaceError::InvalidModel(format!(
                "{} regressor basis has {} values, expected {}",
                name,
                bad.len(),
                POSE_FEATURE_LEN
            )));
        }
        Ok(())
    }
}

/// Head pose from three kernel regressors over offsets to the nose tip.
///
/// Roll uses the angle to each point, pitch the z-scored vertical offsets
/// and yaw the z-scored horizontal offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHeadPoseEstimator {
    roll: KernelRegressor,
    pitch: KernelRegressor,
    yaw: KernelRegressor,
}

impl KernelHeadPoseEstimator {
    pub fn new(roll: KernelRegressor, pitch: KernelRegressor, yaw: KernelRegressor) -> Result<Self> {
        let estimator = Self { roll, pitch, yaw };
        estimator.check()?;
        Ok(estimator)
    }

    /// Read the three regressors from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let estimator: Self = serde_json::from_slice(&bytes)?;
        estimator.check()?;
        info!(
            "Loaded head pose model {} ({} + {} + {} basis vectors)",
            path.display(),
            estimator.roll.basis.len(),
            estimator.pitch.basis.len(),
            estimator.yaw.basis.len()
        );
        Ok(estimator)
    }

    fn check(&self) -> Result<()> {
        self.roll.check("roll")?;
        self.pitch.check("pitch")?;
        self.yaw.check("yaw")
    }
}

impl HeadPoseEstimator for KernelHeadPoseEstimator {
    fn predict(&self, parts: &FacePartMap) -> Result<HeadPose> {
        let features = PoseFeatures::from_parts(parts)?;
        Ok(HeadPose {
            roll: self.roll.predict(&features.roll),
            pitch: self.pitch.predict(&features.pitch),
            yaw: self.yaw.predict(&features.yaw),
        })
    }
}

struct PoseFeatures {
    roll: Vec<f64>,
    pitch: Vec<f64>,
    yaw: Vec<f64>,
}

impl PoseFeatures {
    fn from_parts(parts: &FacePartMap) -> Result<Self> {
        let mut points: Vec<FacePoint> = parts.values().flatten().copied().collect();
        points.sort_by_key(|p| p.index);
        points.dedup();
        if points.len() != POSE_POINTS {
            return Err(FaceError::InvalidArgument(format!(
                "head pose needs {} distinct landmarks, got {}",
                POSE_POINTS,
                points.len()
            )));
        }

        let nose = points[NOSE_TIP].point;
        let offsets: Vec<(f64, f64)> = points
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != NOSE_TIP)
            .map(|(_, p)| ((p.point.x - nose.x) as f64, (p.point.y - nose.y) as f64))
            .collect();

        let roll = offsets
            .iter()
            .map(|&(dx, dy)| {
                let angle = (dx / dy).atan();
                if angle.is_nan() {
                    0.0
                } else {
                    angle
                }
            })
            .collect();
        let pitch = z_score(offsets.iter().map(|&(_, dy)| dy).collect());
        let yaw = z_score(offsets.iter().map(|&(dx, _)| dx).collect());

        Ok(Self { roll, pitch, yaw })
    }
}

/// Population z-score; a constant vector maps to zeros
fn z_score(mut values: Vec<f64>) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| v * v).sum::<f64>() / n - mean * mean;
    let std = variance.max(0.0).sqrt();
    for v in values.iter_mut() {
        *v = if std > 0.0 { (*v - mean) / std } else { 0.0 };
    }
    values
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::engine::{FaceLandmarks, Mode, PredictorModel};
    use crate::geometry::Point;

    /// Returns fixed scores and records the shape and first value of each input
    struct FixedScores {
        scores: Vec<f32>,
        seen: Arc<Mutex<Vec<((usize, usize, usize, usize), f32)>>>,
    }

    impl AttributeNetwork for FixedScores {
        fn classify(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
            self.seen.lock().unwrap().push((input.dim(), input[[0, 0, 0, 0]]));
            Ok(self.scores.clone())
        }
    }

    fn network(scores: &[f32]) -> (Box<dyn AttributeNetwork>, Arc<Mutex<Vec<((usize, usize, usize, usize), f32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let network = FixedScores {
            scores: scores.to_vec(),
            seen: Arc::clone(&seen),
        };
        (Box::new(network), seen)
    }

    fn uniform_image(value: u8) -> Image {
        Image::from_raw(&[value; 64 * 48 * 3], 64, 48, Mode::Rgb).unwrap()
    }

    fn grid_face(dx: i32, dy: i32, stretch: i32) -> FacePartMap {
        let points: Vec<FacePoint> = (0..68)
            .map(|i| {
                let (col, row) = ((i % 9) as i32, (i / 9) as i32);
                FacePoint::new(Point::new(dx + col * 10 * stretch, dy + row * 10), i)
            })
            .collect();
        FaceLandmarks::new(PredictorModel::Large, points).parts().unwrap()
    }

    #[test]
    fn test_gender_as_str() {
        assert_eq!(Gender::Male.as_str(), "male");
        assert_eq!(Gender::Female.as_str(), "female");
    }

    #[test]
    fn test_softmax() {
        let result = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = result.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result[2] > result[1]);
        assert!(result[1] > result[0]);
    }

    #[test]
    fn test_age_groups_are_ordered() {
        assert!(AGE_GROUPS.windows(2).all(|w| w[0].end < w[1].start));
        assert!(AGE_GROUPS.iter().all(|g| g.start <= g.end));
    }

    #[test]
    fn test_predict_picks_most_probable() {
        let (net, seen) = network(&[0.5, 2.0]);
        let mut gender = ClassifierEstimator::gender(net);
        let image = uniform_image(200);
        let location = Location::new(4, 4, 40, 40);

        assert_eq!(gender.predict(&image, &location).unwrap(), Gender::Female);
        let map = gender.predict_probability(&image, &location).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map[&Gender::Female] > map[&Gender::Male]);
        assert!((map.values().sum::<f32>() - 1.0).abs() < 1e-6);

        let seen = seen.lock().unwrap();
        let (dims, first) = seen[0];
        assert_eq!(dims, (1, 3, 227, 227));
        assert!((first - (200.0 - 127.5) / 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_ties_go_to_first_label() {
        let (net, _) = network(&[1.0; 8]);
        let mut age = ClassifierEstimator::age(net);
        assert_eq!(age.predict(&uniform_image(90), &Location::new(0, 0, 30, 30)).unwrap(), 0);
    }

    #[test]
    fn test_emotion_uses_raw_grayscale() {
        let labels: Vec<String> = EMOTION_LABELS.iter().map(|s| s.to_string()).collect();
        let mut scores = vec![0.0; 8];
        scores[2] = 5.0;
        let (net, seen) = network(&scores);
        let mut emotion = ClassifierEstimator::emotion(net, labels).unwrap();

        let label = emotion.predict(&uniform_image(77), &Location::new(10, 10, 50, 40)).unwrap();
        assert_eq!(label, "surprise");
        let (dims, first) = seen.lock().unwrap()[0];
        assert_eq!(dims, (1, 1, 227, 227));
        assert!((first - 77.0).abs() < 1.0);

        let (net, _) = network(&[1.0]);
        assert!(ClassifierEstimator::emotion(net, Vec::new()).is_err());
    }

    #[test]
    fn test_bad_location_or_score_count() {
        let (net, seen) = network(&[1.0, 2.0, 3.0]);
        let mut gender = ClassifierEstimator::gender(net);
        let image = uniform_image(10);

        let outside = Location::new(100, 100, 120, 120);
        assert!(matches!(gender.predict(&image, &outside), Err(FaceError::InvalidArgument(_))));
        assert!(seen.lock().unwrap().is_empty());

        let inside = Location::new(0, 0, 20, 20);
        assert!(matches!(gender.predict(&image, &inside), Err(FaceError::Inference(_))));
    }

    fn regressor_at(x: Vec<f64>, weight: f64) -> KernelRegressor {
        KernelRegressor {
            gamma: 0.5,
            basis: vec![x],
            alpha: vec![weight],
            bias: 0.0,
        }
    }

    #[test]
    fn test_head_pose_is_translation_invariant() {
        let face = grid_face(0, 0, 1);
        let features = PoseFeatures::from_parts(&face).unwrap();
        assert_eq!(features.roll.len(), POSE_FEATURE_LEN);

        let estimator = KernelHeadPoseEstimator::new(
            regressor_at(features.roll, 1.0),
            regressor_at(features.pitch, 2.0),
            regressor_at(features.yaw, 3.0),
        )
        .unwrap();

        let moved = estimator.predict(&grid_face(40, -25, 1)).unwrap();
        assert!((moved.roll - 1.0).abs() < 1e-12);
        assert!((moved.pitch - 2.0).abs() < 1e-12);
        assert!((moved.yaw - 3.0).abs() < 1e-12);

        // Wider faces change the angles but not the z-scored offsets
        let wide = estimator.predict(&grid_face(0, 0, 2)).unwrap();
        assert!(wide.roll < 1.0);
        assert!((wide.pitch - 2.0).abs() < 1e-12);
        assert!((wide.yaw - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_head_pose_needs_68_points() {
        let constant = KernelRegressor {
            gamma: 1.0,
            basis: Vec::new(),
            alpha: Vec::new(),
            bias: 0.0,
        };
        let estimator = KernelHeadPoseEstimator::new(constant.clone(), constant.clone(), constant).unwrap();

        let five = FaceLandmarks::from_points(PredictorModel::Small, &[Point::new(1, 1); 5])
            .parts()
            .unwrap();
        assert!(matches!(estimator.predict(&five), Err(FaceError::InvalidArgument(_))));

        let mut missing = grid_face(0, 0, 1);
        missing.remove(&crate::engine::FacePart::Chin);
        assert!(matches!(estimator.predict(&missing), Err(FaceError::InvalidArgument(_))));
    }

    #[test]
    fn test_load_validates_regressors() {
        let dir = tempfile::tempdir().unwrap();
        let good = KernelHeadPoseEstimator::new(
            regressor_at(vec![0.0; POSE_FEATURE_LEN], 1.0),
            regressor_at(vec![0.0; POSE_FEATURE_LEN], 1.0),
            regressor_at(vec![0.0; POSE_FEATURE_LEN], 1.0),
        )
        .unwrap();
        let path = dir.path().join("pose.json");
        std::fs::write(&path, serde_json::to_vec(&good).unwrap()).unwrap();
        let loaded = KernelHeadPoseEstimator::load(&path).unwrap();
        assert_eq!(loaded.yaw, good.yaw);

        let mut bad = good.clone();
        bad.pitch.basis[0].pop();
        std::fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();
        assert!(matches!(KernelHeadPoseEstimator::load(&path), Err(FaceError::InvalidModel(_))));

        assert!(matches!(
            KernelHeadPoseEstimator::load(&dir.path().join("missing.json")),
            Err(FaceError::Io(_))
        ));
    }
}
