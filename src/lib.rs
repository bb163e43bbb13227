//! Face Recognition Library
//!
//! Detection, landmark localization, 128-d face encodings, matching,
//! nearest neighbour search and face attribute estimation.

pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod matcher;
pub mod search;
pub mod service;
pub mod utils;

pub use config::Config;
pub use encoding::{EncodingRecord, FaceEncoding, ENCODING_DIM};
pub use engine::{
    AgeRange, BlinkState, DetectionModel, EyeBlinkDetector, FaceLandmarks, FacePart, FacePartMap, Gender,
    HeadPose, Image, Mode, ModelRegistry, PredictorModel, AGE_GROUPS,
};
pub use error::{FaceError, Result};
pub use geometry::{FacePoint, Location, Point};
pub use matcher::{compare_face, compare_faces, face_distance, face_distances, DEFAULT_TOLERANCE};
pub use search::{AnnoySearch, KnnSearch, Neighbor, Search, SearchKind};
pub use service::FaceRecognition;
