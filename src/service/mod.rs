//! Service layer module

pub mod face_service;

pub use face_service::FaceRecognition;
