//! Face recognition facade
//!
//! Wires detection, landmark localization, encoding and the optional
//! attribute estimators together over one set of loaded models.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::Config;
use crate::encoding::FaceEncoding;
use crate::engine::{
    AgeEstimator, BlinkState, DetectionModel, Detector, EmotionEstimator, Encoder, EyeBlinkDetector,
    FaceLandmarks, FacePartMap, Gender, GenderEstimator, HeadPose, HeadPoseEstimator, Image,
    LandmarkLocator, ModelRegistry, PredictorModel,
};
use crate::engine::blink::{self, DEFAULT_EAR_THRESHOLD};
use crate::error::{FaceError, Result};
use crate::geometry::Location;
use crate::matcher;

/// Up-sampling used when landmarks or encodings are requested without boxes
pub const IMPLICIT_UPSAMPLE: u32 = 1;

/// Face recognition pipeline
pub struct FaceRecognition {
    detector: Detector,
    landmarks: LandmarkLocator,
    encoder: Encoder,
    blink_thresholds: (f64, f64),
    age: Option<Box<AgeEstimator>>,
    gender: Option<Box<GenderEstimator>>,
    emotion: Option<Box<EmotionEstimator>>,
    head_pose: Option<Box<dyn HeadPoseEstimator>>,
    config: Config,
}

impl FaceRecognition {
    /// Load every model named by `config` and build the pipeline
    pub fn create(config: Config) -> Result<Self> {
        let registry = ModelRegistry::load(&config.models, &config.inference, &config.detection)?;
        Self::from_registry(registry, config)
    }

    /// Build the pipeline from already loaded models
    pub fn from_registry(registry: ModelRegistry, config: Config) -> Result<Self> {
        let ModelRegistry {
            fast_locator,
            accurate_locator,
            large_predictor,
            small_predictor,
            helen_predictor,
            descriptor,
            age_estimator,
            gender_estimator,
            emotion_estimator,
            head_pose_estimator,
        } = registry;

        let detector = Detector::new(fast_locator, accurate_locator);
        let landmarks = LandmarkLocator::new(large_predictor, small_predictor, helen_predictor)?;
        let encoder = Encoder::new(descriptor, &config.encoding)?;

        info!(
            "Face recognition ready (detector {:?}, predictor {:?})",
            config.detection.model, config.encoding.predictor
        );

        Ok(Self {
            detector,
            landmarks,
            encoder,
            blink_thresholds: (DEFAULT_EAR_THRESHOLD, DEFAULT_EAR_THRESHOLD),
            age: age_estimator,
            gender: gender_estimator,
            emotion: emotion_estimator,
            head_pose: head_pose_estimator,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Eye aspect ratios below which each eye counts as closed
    pub fn set_blink_thresholds(&mut self, left: f64, right: f64) {
        self.blink_thresholds = (left, right);
    }

    /// Bounding boxes of the faces in `image`
    pub fn face_locations(
        &mut self,
        image: &Image,
        upsample: u32,
        model: DetectionModel,
    ) -> Result<Vec<Location>> {
        let start = Instant::now();
        let locations = self.detector.face_locations(image, upsample, model)?;
        debug!("Face locations in {:?}", start.elapsed());
        Ok(locations)
    }

    /// Bounding boxes for equally sized images, accurate model only
    pub fn batch_face_locations(
        &mut self,
        images: &[Image],
        upsample: u32,
        batch_size: usize,
    ) -> Result<Vec<Vec<Location>>> {
        self.detector.batch_face_locations(images, upsample, batch_size)
    }

    /// Ordered landmark points per face.
    ///
    /// With `locations == None` the faces are found first with
    /// `detection_model` at an up-sampling of one.
    pub fn raw_face_landmarks(
        &mut self,
        image: &Image,
        locations: Option<&[Location]>,
        model: PredictorModel,
        detection_model: DetectionModel,
    ) -> Result<Vec<FaceLandmarks>> {
        let detected;
        let locations = match locations {
            Some(locations) => locations,
            None => {
                detected = self.detector.face_locations(image, IMPLICIT_UPSAMPLE, detection_model)?;
                &detected
            }
        };
        self.landmarks.locate(image, locations, model)
    }

    /// Landmarks grouped into named face parts, one map per face
    pub fn face_landmarks(
        &mut self,
        image: &Image,
        locations: Option<&[Location]>,
        model: PredictorModel,
        detection_model: DetectionModel,
    ) -> Result<Vec<FacePartMap>> {
        self.raw_face_landmarks(image, locations, model, detection_model)?
            .iter()
            .map(FaceLandmarks::parts)
            .collect()
    }

    /// One 128-dimensional encoding per face
    pub fn face_encodings(
        &mut self,
        image: &Image,
        locations: Option<&[Location]>,
        jitters: u32,
        predictor: PredictorModel,
        detection_model: DetectionModel,
    ) -> Result<Vec<FaceEncoding>> {
        if predictor == PredictorModel::Helen {
            return Err(FaceError::InvalidArgument(
                "encodings need large or small landmarks".into(),
            ));
        }

        let start = Instant::now();
        let landmarks = self.raw_face_landmarks(image, locations, predictor, detection_model)?;
        let encodings = self.encoder.encode(image, &landmarks, jitters)?;
        debug!("Encoded {} faces in {:?}", encodings.len(), start.elapsed());
        Ok(encodings)
    }

    /// Encodings for many images from precomputed landmarks.
    ///
    /// `landmarks[i]` belongs to `images[i]`; the result mirrors that shape.
    pub fn batch_face_encodings(
        &mut self,
        images: &[Image],
        landmarks: &[Vec<FaceLandmarks>],
        jitters: u32,
    ) -> Result<Vec<Vec<FaceEncoding>>> {
        if images.len() != landmarks.len() {
            return Err(FaceError::InvalidArgument(format!(
                "{} images but {} landmark sets",
                images.len(),
                landmarks.len()
            )));
        }

        let items: Vec<(&Image, &[FaceLandmarks])> = images
            .iter()
            .zip(landmarks.iter())
            .map(|(image, sets)| (image, sets.as_slice()))
            .collect();

        let start = Instant::now();
        let encodings = self.encoder.encode_batch(&items, jitters)?;
        info!("Batch encoded {} images in {:?}", images.len(), start.elapsed());
        Ok(encodings)
    }

    /// One image per location, cropped to the clamped rectangle.
    ///
    /// Locations entirely outside the image are skipped.
    pub fn crop_faces(image: &Image, locations: &[Location]) -> Vec<Image> {
        locations.iter().filter_map(|location| image.crop(location)).collect()
    }

    /// Blink state for 68 or 194 point landmarks; the layout is read from the eyes
    pub fn eye_blink_detect(&self, parts: &FacePartMap) -> Result<BlinkState> {
        let (left, right) = self.blink_thresholds;
        EyeBlinkDetector::new(blink::eye_layout(parts)?, left, right)?.detect(parts)
    }

    pub fn set_age_estimator(&mut self, estimator: Box<AgeEstimator>) {
        self.age = Some(estimator);
    }

    pub fn set_gender_estimator(&mut self, estimator: Box<GenderEstimator>) {
        self.gender = Some(estimator);
    }

    pub fn set_emotion_estimator(&mut self, estimator: Box<EmotionEstimator>) {
        self.emotion = Some(estimator);
    }

    pub fn set_head_pose_estimator(&mut self, estimator: Box<dyn HeadPoseEstimator>) {
        self.head_pose = Some(estimator);
    }

    /// Age group of the face under `location`, an index into [`crate::AGE_GROUPS`]
    pub fn predict_age(&mut self, image: &Image, location: &Location) -> Result<u32> {
        estimator(&mut self.age, "age estimator")?.predict(image, location)
    }

    pub fn predict_probability_age(&mut self, image: &Image, location: &Location) -> Result<BTreeMap<u32, f32>> {
        estimator(&mut self.age, "age estimator")?.predict_probability(image, location)
    }

    pub fn predict_gender(&mut self, image: &Image, location: &Location) -> Result<Gender> {
        estimator(&mut self.gender, "gender estimator")?.predict(image, location)
    }

    pub fn predict_probability_gender(
        &mut self,
        image: &Image,
        location: &Location,
    ) -> Result<BTreeMap<Gender, f32>> {
        estimator(&mut self.gender, "gender estimator")?.predict_probability(image, location)
    }

    pub fn predict_emotion(&mut self, image: &Image, location: &Location) -> Result<String> {
        estimator(&mut self.emotion, "emotion estimator")?.predict(image, location)
    }

    pub fn predict_probability_emotion(
        &mut self,
        image: &Image,
        location: &Location,
    ) -> Result<BTreeMap<String, f32>> {
        estimator(&mut self.emotion, "emotion estimator")?.predict_probability(image, location)
    }

    /// Head pose from a 68 point part map
    pub fn predict_head_pose(&self, parts: &FacePartMap) -> Result<HeadPose> {
        self.head_pose
            .as_deref()
            .ok_or(FaceError::EstimatorNotConfigured("head pose estimator"))?
            .predict(parts)
    }

    pub fn face_distance(a: &FaceEncoding, b: &FaceEncoding) -> f64 {
        matcher::face_distance(a, b)
    }

    pub fn face_distances(known: &[FaceEncoding], candidate: &FaceEncoding) -> Vec<f64> {
        matcher::face_distances(known, candidate)
    }

    pub fn compare_face(known: &FaceEncoding, candidate: &FaceEncoding, tolerance: f64) -> bool {
        matcher::compare_face(known, candidate, tolerance)
    }

    pub fn compare_faces(known: &[FaceEncoding], candidate: &FaceEncoding, tolerance: f64) -> Vec<bool> {
        matcher::compare_faces(known, candidate, tolerance)
    }
}

fn estimator<'a, T: ?Sized>(slot: &'a mut Option<Box<T>>, name: &'static str) -> Result<&'a mut T> {
    slot.as_deref_mut().ok_or(FaceError::EstimatorNotConfigured(name))
}
