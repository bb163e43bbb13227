//! Recognition engine
//!
//! Detection, landmark localization, descriptor extraction and attribute
//! estimation, plus the registry that turns model files into the
//! capabilities they need.

pub mod attribute;
pub mod blink;
pub mod detector;
pub mod encoder;
pub mod image;
pub mod landmarks;
pub mod preprocess;
pub mod registry;
pub mod shape_predictor;

pub use attribute::{
    AgeEstimator, AgeRange, AttributeEstimator, AttributeNetwork, ClassifierEstimator, EmotionEstimator, Gender,
    GenderEstimator, HeadPose, HeadPoseEstimator, KernelHeadPoseEstimator, KernelRegressor, AGE_GROUPS,
};
pub use blink::{BlinkState, EyeBlinkDetector};
pub use detector::{DetectionModel, Detector, FaceLocator, RawDetection};
pub use encoder::{DescriptorNetwork, Encoder};
pub use self::image::{Image, Mode};
pub use landmarks::{FaceLandmarks, FacePart, FacePartMap, LandmarkLocator, PredictorModel};
pub use registry::ModelRegistry;
pub use shape_predictor::{LandmarkPredictor, ShapePredictor};
