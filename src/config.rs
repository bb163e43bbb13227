//! Face recognition configuration

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::engine::{DetectionModel, PredictorModel};
use crate::search::SearchKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub inference: InferenceConfig,
    pub detection: DetectionConfig,
    pub encoding: EncodingConfig,
    pub matching: MatchingConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub directory: PathBuf,
    /// Optional 194 point predictor; defaults to `helen-dataset.dat` in `directory` when present
    pub helen_predictor: Option<PathBuf>,
    /// Optional attribute models; each estimator stays unavailable without its file
    pub age_model: Option<PathBuf>,
    pub gender_model: Option<PathBuf>,
    pub emotion_model: Option<PathBuf>,
    /// Emotion network classes in output order
    pub emotion_labels: Vec<String>,
    /// Head pose regressors as JSON
    pub head_pose_model: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model: DetectionModel,
    pub upsample: u32,
    pub batch_size: usize,
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub predictor: PredictorModel,
    pub jitters: u32,
    pub batch_size: usize,
    pub chip_size: u32,
    pub padding: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub tolerance: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub kind: SearchKind,
    pub tree_count: usize,
    pub search_budget: Option<usize>,
    pub top_k: usize,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "facerec.toml"
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("models"),
            helen_predictor: None,
            age_model: None,
            gender_model: None,
            emotion_model: None,
            emotion_labels: crate::engine::attribute::EMOTION_LABELS
                .iter()
                .map(|label| label.to_string())
                .collect(),
            head_pose_model: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: DetectionModel::Fast,
            upsample: 1,
            batch_size: 128,
            min_face_size: 20,
            score_threshold: 2.0,
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            predictor: PredictorModel::Small,
            jitters: 1,
            batch_size: 16,
            chip_size: crate::engine::preprocess::CHIP_SIZE,
            padding: crate::engine::preprocess::CHIP_PADDING,
            seed: None,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            tolerance: crate::matcher::DEFAULT_TOLERANCE,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            kind: SearchKind::Exact,
            tree_count: crate::search::DEFAULT_TREE_COUNT,
            search_budget: None,
            top_k: 5,
        }
    }
}
