//! Face Recognition CLI
//!
//! Detects, describes, compares and searches faces in image files and
//! estimates their attributes. Every subcommand prints JSON on stdout; logs
//! go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use facerec::config::Config;
use facerec::search::create_search;
use facerec::{
    AgeRange, DetectionModel, EncodingRecord, FaceEncoding, FaceError, FacePartMap, FaceRecognition, Gender,
    HeadPose, Image, Location, Mode, Neighbor, PredictorModel, AGE_GROUPS,
};

#[derive(Parser, Debug)]
#[command(name = "facerec")]
#[command(author, version, about = "Face detection, encoding and search", long_about = None)]
struct Cli {
    /// Configuration file (default: facerec.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Model directory, overrides the configuration
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Face bounding boxes per image
    Detect {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Times to double the image before detection
        #[arg(long)]
        upsample: Option<u32>,

        #[arg(long, value_enum)]
        model: Option<DetectorArg>,
    },
    /// Landmarks grouped by face part
    Landmarks {
        image: PathBuf,

        #[arg(long, value_enum, default_value_t = PredictorArg::Large)]
        predictor: PredictorArg,
    },
    /// 128-d encodings of every face
    Encode {
        image: PathBuf,

        #[arg(long)]
        jitters: Option<u32>,
    },
    /// Compare every face in `known` to the first face in `candidate`
    Compare {
        known: PathBuf,
        candidate: PathBuf,

        #[arg(long)]
        tolerance: Option<f64>,
    },
    /// Age group, gender, emotion and head pose of every face, as far as
    /// the estimators are configured
    Attributes { image: PathBuf },
    /// Rank gallery faces by distance to each face in `query`
    Search {
        /// Directory of gallery images
        #[arg(long)]
        gallery: PathBuf,

        query: PathBuf,

        #[arg(long)]
        top_k: Option<usize>,

        /// Use the approximate index
        #[arg(long)]
        approximate: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DetectorArg {
    Fast,
    Accurate,
}

impl From<DetectorArg> for DetectionModel {
    fn from(arg: DetectorArg) -> Self {
        match arg {
            DetectorArg::Fast => DetectionModel::Fast,
            DetectorArg::Accurate => DetectionModel::Accurate,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PredictorArg {
    Large,
    Small,
    Helen,
}

impl From<PredictorArg> for PredictorModel {
    fn from(arg: PredictorArg) -> Self {
        match arg {
            PredictorArg::Large => PredictorModel::Large,
            PredictorArg::Small => PredictorModel::Small,
            PredictorArg::Helen => PredictorModel::Helen,
        }
    }
}

#[derive(Serialize)]
struct DetectOutput {
    image: String,
    width: u32,
    height: u32,
    faces: Vec<Location>,
}

#[derive(Serialize)]
struct LandmarksOutput {
    image: String,
    faces: Vec<FacePartMap>,
}

#[derive(Serialize)]
struct EncodeOutput {
    image: String,
    encodings: Vec<EncodingRecord>,
}

#[derive(Serialize)]
struct CompareOutput {
    tolerance: f64,
    distances: Vec<f64>,
    matches: Vec<bool>,
}

#[derive(Serialize)]
struct FaceAttributes {
    location: Location,
    age: Option<AgeRange>,
    gender: Option<Gender>,
    emotion: Option<String>,
    head_pose: Option<HeadPose>,
}

#[derive(Serialize)]
struct AttributesOutput {
    image: String,
    faces: Vec<FaceAttributes>,
}

#[derive(Serialize)]
struct SearchHit {
    image: String,
    face: usize,
    distance: f64,
}

#[derive(Serialize)]
struct SearchOutput {
    query: String,
    face: usize,
    hits: Vec<SearchHit>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load(Config::default_path()).unwrap_or_else(|e| {
            info!("Using default config ({})", e);
            Config::default()
        }),
    };
    if let Some(models) = &cli.models {
        config.models.directory = models.clone();
    }

    info!("Device: {}, models: {}", config.inference.device, config.models.directory.display());

    let mut faces = FaceRecognition::create(config.clone())
        .with_context(|| format!("Failed to load models from {}", config.models.directory.display()))?;

    match cli.command {
        Command::Detect {
            images,
            upsample,
            model,
        } => {
            let upsample = upsample.unwrap_or(config.detection.upsample);
            let model = model.map(DetectionModel::from).unwrap_or(config.detection.model);
            let mut outputs = Vec::with_capacity(images.len());
            for path in &images {
                let image = load_image(path)?;
                let locations = faces.face_locations(&image, upsample, model)?;
                outputs.push(DetectOutput {
                    image: path.display().to_string(),
                    width: image.width(),
                    height: image.height(),
                    faces: locations,
                });
            }
            print_json(&outputs)
        }
        Command::Landmarks { image: path, predictor } => {
            let image = load_image(&path)?;
            let parts = faces.face_landmarks(&image, None, predictor.into(), config.detection.model)?;
            print_json(&LandmarksOutput {
                image: path.display().to_string(),
                faces: parts,
            })
        }
        Command::Encode { image: path, jitters } => {
            let image = load_image(&path)?;
            let encodings = encode(&mut faces, &config, &image, jitters)?;
            print_json(&EncodeOutput {
                image: path.display().to_string(),
                encodings: encodings.iter().map(FaceEncoding::to_record).collect(),
            })
        }
        Command::Compare {
            known,
            candidate,
            tolerance,
        } => {
            let tolerance = tolerance.unwrap_or(config.matching.tolerance);
            let known = encode(&mut faces, &config, &load_image(&known)?, None)?;
            let candidates = encode(&mut faces, &config, &load_image(&candidate)?, None)?;
            let Some(candidate_encoding) = candidates.first() else {
                bail!("No face found in {}", candidate.display());
            };
            print_json(&CompareOutput {
                tolerance,
                distances: FaceRecognition::face_distances(&known, candidate_encoding),
                matches: FaceRecognition::compare_faces(&known, candidate_encoding, tolerance),
            })
        }
        Command::Attributes { image: path } => {
            let image = load_image(&path)?;
            let locations = faces.face_locations(&image, config.detection.upsample, config.detection.model)?;
            let parts = faces.face_landmarks(
                &image,
                Some(locations.as_slice()),
                PredictorModel::Large,
                config.detection.model,
            )?;
            let mut outputs = Vec::with_capacity(locations.len());
            for (location, parts) in locations.iter().zip(parts.iter()) {
                let age = configured(faces.predict_age(&image, location))?;
                outputs.push(FaceAttributes {
                    location: *location,
                    age: age.and_then(|group| AGE_GROUPS.get(group as usize).copied()),
                    gender: configured(faces.predict_gender(&image, location))?,
                    emotion: configured(faces.predict_emotion(&image, location))?,
                    head_pose: configured(faces.predict_head_pose(parts))?,
                });
            }
            print_json(&AttributesOutput {
                image: path.display().to_string(),
                faces: outputs,
            })
        }
        Command::Search {
            gallery,
            query,
            top_k,
            approximate,
        } => {
            if approximate {
                config.search.kind = facerec::SearchKind::Approximate;
            }
            let top_k = top_k.unwrap_or(config.search.top_k);
            run_search(&mut faces, &config, &gallery, &query, top_k)
        }
    }
}

fn run_search(
    faces: &mut FaceRecognition,
    config: &Config,
    gallery: &Path,
    query: &Path,
    top_k: usize,
) -> Result<()> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(gallery)
        .with_context(|| format!("Failed to read gallery {}", gallery.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut index = create_search(&config.search);
    let mut labels: Vec<(String, usize)> = Vec::new();
    for path in &files {
        let image = match Image::load_file(path, Mode::Rgb) {
            Ok(image) => image,
            Err(e) => {
                info!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        for (face, encoding) in encode(faces, config, &image, None)?.iter().enumerate() {
            index.add(labels.len() as i32, encoding)?;
            labels.push((path.display().to_string(), face));
        }
    }
    index.build()?;
    info!("Indexed {} faces from {} files", labels.len(), files.len());

    let query_image = load_image(query)?;
    let mut outputs = Vec::new();
    for (face, encoding) in encode(faces, config, &query_image, None)?.iter().enumerate() {
        let hits = index
            .query(encoding, top_k)?
            .into_iter()
            .filter_map(|Neighbor { label, distance }| {
                let (image, face) = labels.get(usize::try_from(label).ok()?)?.clone();
                Some(SearchHit { image, face, distance })
            })
            .collect();
        outputs.push(SearchOutput {
            query: query.display().to_string(),
            face,
            hits,
        });
    }
    index.dispose();

    print_json(&outputs)
}

fn encode(
    faces: &mut FaceRecognition,
    config: &Config,
    image: &Image,
    jitters: Option<u32>,
) -> Result<Vec<FaceEncoding>> {
    let encodings = faces.face_encodings(
        image,
        None,
        jitters.unwrap_or(config.encoding.jitters),
        config.encoding.predictor,
        config.detection.model,
    )?;
    Ok(encodings)
}

/// `None` for an estimator that has no model
fn configured<T>(result: facerec::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(FaceError::EstimatorNotConfigured(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_image(path: &Path) -> Result<Image> {
    Image::load_file(path, Mode::Rgb).with_context(|| format!("Failed to load image {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
