//! Eye blink detection from the eye aspect ratio

use super::landmarks::{FacePart, FacePartMap, PredictorModel};
use crate::error::{FaceError, Result};
use crate::geometry::FacePoint;

pub const DEFAULT_EAR_THRESHOLD: f64 = 0.2;

// Six contour points per eye: outer corner, two upper, inner corner, two lower
const LARGE_EYE_POINTS: [usize; 6] = [0, 1, 2, 3, 4, 5];
const HELEN_EYE_POINTS: [usize; 6] = [0, 3, 7, 10, 13, 17];

const LARGE_EYE_LEN: usize = 6;
const HELEN_EYE_LEN: usize = 20;

/// Predictor that produced `parts`, judged by the size of the eye contours.
pub fn eye_layout(parts: &FacePartMap) -> Result<PredictorModel> {
    let left = eye(parts, FacePart::LeftEye)?.len();
    let right = eye(parts, FacePart::RightEye)?.len();
    match (left, right) {
        (LARGE_EYE_LEN, LARGE_EYE_LEN) => Ok(PredictorModel::Large),
        (HELEN_EYE_LEN, HELEN_EYE_LEN) => Ok(PredictorModel::Helen),
        _ => Err(FaceError::InvalidArgument(format!(
            "no blink layout for eyes of {} and {} points",
            left, right
        ))),
    }
}

/// Blink state of both eyes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkState {
    pub left: bool,
    pub right: bool,
}

/// Flags an eye as closed when its aspect ratio drops below a threshold.
#[derive(Debug, Clone, Copy)]
pub struct EyeBlinkDetector {
    pub left_threshold: f64,
    pub right_threshold: f64,
    model: PredictorModel,
    eye_points: [usize; 6],
}

impl EyeBlinkDetector {
    /// Detector for landmarks of `model`; the 5 point model has too few eye points
    pub fn new(model: PredictorModel, left_threshold: f64, right_threshold: f64) -> Result<Self> {
        let eye_points = match model {
            PredictorModel::Large => LARGE_EYE_POINTS,
            PredictorModel::Helen => HELEN_EYE_POINTS,
            PredictorModel::Small => {
                return Err(FaceError::InvalidArgument(
                    "blink detection needs large or helen landmarks".into(),
                ))
            }
        };
        Ok(Self {
            left_threshold,
            right_threshold,
            model,
            eye_points,
        })
    }

    pub fn model(&self) -> PredictorModel {
        self.model
    }

    /// Blink state of both eyes; `parts` must come from this detector's model
    pub fn detect(&self, parts: &FacePartMap) -> Result<BlinkState> {
        let layout = eye_layout(parts)?;
        if layout != self.model {
            return Err(FaceError::InvalidArgument(format!(
                "{:?} blink detector given {:?} landmarks",
                self.model, layout
            )));
        }

        let left = eye(parts, FacePart::LeftEye)?;
        let right = eye(parts, FacePart::RightEye)?;

        Ok(BlinkState {
            left: self.aspect_ratio(left)? < self.left_threshold,
            right: self.aspect_ratio(right)? < self.right_threshold,
        })
    }

    /// `(|p1 - p5| + |p2 - p4|) / (2 |p0 - p3|)`
    pub fn aspect_ratio(&self, eye: &[FacePoint]) -> Result<f64> {
        let p = |i: usize| {
            eye.get(self.eye_points[i])
                .map(|fp| fp.point)
                .ok_or_else(|| FaceError::InvalidArgument(format!("eye has only {} points", eye.len())))
        };

        let a = p(1)?.distance(&p(5)?);
        let b = p(2)?.distance(&p(4)?);
        let c = p(0)?.distance(&p(3)?);
        Ok((a + b) / (2.0 * c))
    }
}

fn eye(parts: &FacePartMap, part: FacePart) -> Result<&[FacePoint]> {
    parts
        .get(&part)
        .map(Vec::as_slice)
        .ok_or_else(|| FaceError::InvalidArgument(format!("landmarks have no {:?}", part)))
}
