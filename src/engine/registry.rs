//! Model registry
//!
//! Resolves the fixed model file names inside one directory and turns each
//! blob into a callable capability. The registry is an explicit value handed
//! to the pipeline; nothing is cached globally.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array4;
use openvino::{CompiledModel, Core, ElementType, Shape, Tensor};
use tracing::{debug, info};

use super::attribute::{
    AgeEstimator, AttributeNetwork, ClassifierEstimator, EmotionEstimator, GenderEstimator, HeadPoseEstimator,
    KernelHeadPoseEstimator, OpenVinoClassifier,
};
use super::detector::{CnnLocator, FaceLocator, SeetaLocator};
use super::encoder::{DescriptorNetwork, OpenVinoDescriptor};
use super::shape_predictor::{LandmarkPredictor, ShapePredictor};
use crate::config::{DetectionConfig, InferenceConfig, ModelsConfig};
use crate::error::{FaceError, Result};

pub const FAST_DETECTOR_MODEL: &str = "seeta_fd_frontal_v1.0.bin";
pub const CNN_DETECTOR_MODEL: &str = "face_detector_cnn.onnx";
pub const LARGE_PREDICTOR_MODEL: &str = "shape_predictor_68_face_landmarks.dat";
pub const SMALL_PREDICTOR_MODEL: &str = "shape_predictor_5_face_landmarks.dat";
pub const DESCRIPTOR_MODEL: &str = "face_recognition_resnet_model_v1.onnx";
pub const HELEN_PREDICTOR_MODEL: &str = "helen-dataset.dat";

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A compiled OpenVINO network with a single input.
///
/// Holds a reference to the core it was compiled with so the runtime
/// outlives every network created from it.
pub struct OpenVinoNetwork {
    name: String,
    compiled: CompiledModel,
    _core: Arc<SafeCore>,
}

// CompiledModel wraps a native handle; the network is only used through &mut self
unsafe impl Send for OpenVinoNetwork {}

impl OpenVinoNetwork {
    fn new(name: String, compiled: CompiledModel, core: &Arc<SafeCore>) -> Self {
        Self {
            name,
            compiled,
            _core: Arc::clone(core),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one NCHW batch; returns every output tensor flattened, in index order
    pub fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<Vec<f32>>> {
        let (n, c, h, w) = input.dim();
        let shape = Shape::new(&[n as i64, c as i64, h as i64, w as i64]).map_err(FaceError::inference)?;
        let mut tensor = Tensor::new(ElementType::F32, &shape).map_err(FaceError::inference)?;

        let input = input.as_standard_layout();
        let input_data = input
            .as_slice()
            .ok_or_else(|| FaceError::Inference("input tensor is not contiguous".into()))?;
        {
            let raw = tensor.get_raw_data_mut().map_err(FaceError::inference)?;
            if raw.len() != input_data.len() * std::mem::size_of::<f32>() {
                return Err(FaceError::Inference(format!(
                    "tensor holds {} bytes, input has {} floats",
                    raw.len(),
                    input_data.len()
                )));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    input_data.as_ptr(),
                    raw.as_mut_ptr() as *mut f32,
                    input_data.len(),
                );
            }
        }

        let mut request = self
            .compiled
            .create_infer_request()
            .map_err(FaceError::inference)?;
        request.set_input_tensor(&tensor).map_err(FaceError::inference)?;
        request.infer().map_err(FaceError::inference)?;

        let mut outputs = Vec::new();
        while let Ok(output) = request.get_output_tensor_by_index(outputs.len()) {
            outputs.push(read_tensor_f32(&output)?);
        }
        if outputs.is_empty() {
            return Err(FaceError::Inference(format!("{} produced no outputs", self.name)));
        }

        debug!("{} ran batch of {} with {} outputs", self.name, n, outputs.len());
        Ok(outputs)
    }
}

fn compile_network(core: &mut Core, path: &Path, device: &str) -> Result<(String, CompiledModel)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path_str = path
        .to_str()
        .ok_or_else(|| FaceError::InvalidArgument(format!("non UTF-8 path {}", path.display())))?;

    info!("Loading model: {} on {}", name, device);
    let start = Instant::now();

    let model = core
        .read_model_from_file(path_str, "")
        .map_err(FaceError::inference)?;
    let compiled = core
        .compile_model(&model, device.into())
        .map_err(FaceError::inference)?;

    info!("Model {} loaded in {:?}", name, start.elapsed());
    Ok((name, compiled))
}

/// Read tensor data as f32 vector
fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape().map_err(FaceError::inference)?;
    let total: i64 = shape.get_dimensions().iter().product();
    let raw = tensor.get_raw_data().map_err(FaceError::inference)?;

    let len = (total.max(0) as usize).min(raw.len() / std::mem::size_of::<f32>());
    let data = raw
        .chunks_exact(4)
        .take(len)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(data)
}

/// Every loaded model, ready to be handed to the pipeline.
pub struct ModelRegistry {
    pub fast_locator: Box<dyn FaceLocator>,
    pub accurate_locator: Box<dyn FaceLocator>,
    pub large_predictor: Box<dyn LandmarkPredictor>,
    pub small_predictor: Box<dyn LandmarkPredictor>,
    pub helen_predictor: Option<Box<dyn LandmarkPredictor>>,
    pub descriptor: Box<dyn DescriptorNetwork>,
    pub age_estimator: Option<Box<AgeEstimator>>,
    pub gender_estimator: Option<Box<GenderEstimator>>,
    pub emotion_estimator: Option<Box<EmotionEstimator>>,
    pub head_pose_estimator: Option<Box<dyn HeadPoseEstimator>>,
}

impl ModelRegistry {
    /// Load every model from `models.directory`.
    ///
    /// Fails on the first missing file; nothing is partially kept. Attribute
    /// models are optional, but a configured path must exist.
    pub fn load(
        models: &ModelsConfig,
        inference: &InferenceConfig,
        detection: &DetectionConfig,
    ) -> Result<Self> {
        let dir = &models.directory;
        if !dir.is_dir() {
            return Err(FaceError::ModelDirectoryNotFound(dir.clone()));
        }

        let fast_path = require(dir, FAST_DETECTOR_MODEL)?;
        let cnn_path = require(dir, CNN_DETECTOR_MODEL)?;
        let large_path = require(dir, LARGE_PREDICTOR_MODEL)?;
        let small_path = require(dir, SMALL_PREDICTOR_MODEL)?;
        let descriptor_path = require(dir, DESCRIPTOR_MODEL)?;
        let helen_path = match &models.helen_predictor {
            Some(path) if !path.is_file() => return Err(FaceError::ModelFileNotFound(path.clone())),
            Some(path) => Some(path.clone()),
            None => Some(dir.join(HELEN_PREDICTOR_MODEL)).filter(|p| p.is_file()),
        };
        let age_path = optional(&models.age_model)?;
        let gender_path = optional(&models.gender_model)?;
        let emotion_path = optional(&models.emotion_model)?;
        let head_pose_path = optional(&models.head_pose_model)?;

        info!("Loading models from {}", dir.display());
        let start = Instant::now();

        let fast_locator = SeetaLocator::load(&fast_path, detection)?;
        let large_predictor = ShapePredictor::load(&large_path)?;
        let small_predictor = ShapePredictor::load(&small_path)?;
        let helen_predictor = helen_path.map(ShapePredictor::load).transpose()?;
        let head_pose_estimator = head_pose_path
            .as_deref()
            .map(KernelHeadPoseEstimator::load)
            .transpose()?;

        let mut core = Core::new().map_err(FaceError::inference)?;
        let (cnn_name, cnn_model) = compile_network(&mut core, &cnn_path, &inference.device)?;
        let (descriptor_name, descriptor_model) =
            compile_network(&mut core, &descriptor_path, &inference.device)?;

        let mut attribute_networks = Vec::new();
        for path in [&age_path, &gender_path, &emotion_path] {
            let compiled = match path {
                Some(path) => Some(compile_network(&mut core, path, &inference.device)?),
                None => None,
            };
            attribute_networks.push(compiled);
        }

        let core = Arc::new(SafeCore(core));
        let cnn = OpenVinoNetwork::new(cnn_name, cnn_model, &core);
        let descriptor = OpenVinoNetwork::new(descriptor_name, descriptor_model, &core);
        let mut attribute_networks = attribute_networks.into_iter().map(|compiled| {
            compiled.map(|(name, model)| {
                let network = OpenVinoNetwork::new(name, model, &core);
                Box::new(OpenVinoClassifier::new(network)) as Box<dyn AttributeNetwork>
            })
        });
        let age_network = attribute_networks.next().flatten();
        let gender_network = attribute_networks.next().flatten();
        let emotion_network = attribute_networks.next().flatten();

        let emotion_estimator = match emotion_network {
            Some(network) => Some(ClassifierEstimator::emotion(network, models.emotion_labels.clone())?),
            None => None,
        };

        info!("All models loaded in {:?}", start.elapsed());

        Ok(Self {
            fast_locator: Box::new(fast_locator),
            accurate_locator: Box::new(CnnLocator::new(cnn, detection)),
            large_predictor: Box::new(large_predictor),
            small_predictor: Box::new(small_predictor),
            helen_predictor: helen_predictor.map(|p| Box::new(p) as Box<dyn LandmarkPredictor>),
            descriptor: Box::new(OpenVinoDescriptor::new(descriptor)),
            age_estimator: age_network.map(|n| Box::new(ClassifierEstimator::age(n)) as Box<AgeEstimator>),
            gender_estimator: gender_network.map(|n| Box::new(ClassifierEstimator::gender(n)) as Box<GenderEstimator>),
            emotion_estimator: emotion_estimator.map(|e| Box::new(e) as Box<EmotionEstimator>),
            head_pose_estimator: head_pose_estimator.map(|e| Box::new(e) as Box<dyn HeadPoseEstimator>),
        })
    }
}

fn optional(path: &Option<PathBuf>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) if !path.is_file() => Err(FaceError::ModelFileNotFound(path.clone())),
        other => Ok(other.clone()),
    }
}

fn require(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    if !path.is_file() {
        return Err(FaceError::ModelFileNotFound(path));
    }
    Ok(path)
}
