//! Landmark localization and face part tables

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::image::Image;
use super::shape_predictor::LandmarkPredictor;
use crate::error::{FaceError, Result};
use crate::geometry::{FacePoint, Location, Point};

/// Which shape predictor to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictorModel {
    /// 68 points
    Large,
    /// 5 points
    Small,
    /// 194 points, trained on the Helen dataset; optional model
    Helen,
}

impl PredictorModel {
    pub fn num_parts(self) -> usize {
        match self {
            PredictorModel::Large => 68,
            PredictorModel::Small => 5,
            PredictorModel::Helen => 194,
        }
    }
}

/// Named anatomical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FacePart {
    Chin,
    LeftEyebrow,
    RightEyebrow,
    NoseBridge,
    NoseTip,
    /// Whole nose, only produced by the Helen table
    Nose,
    LeftEye,
    RightEye,
    TopLip,
    BottomLip,
}

pub type FacePartMap = BTreeMap<FacePart, Vec<FacePoint>>;

/// Raw predictor output for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub model: PredictorModel,
    pub points: Vec<FacePoint>,
}

impl FaceLandmarks {
    pub fn new(model: PredictorModel, points: Vec<FacePoint>) -> Self {
        Self { model, points }
    }

    /// Build from bare pixel positions, indices assigned in order
    pub fn from_points(model: PredictorModel, points: &[Point]) -> Self {
        let points = points
            .iter()
            .enumerate()
            .map(|(index, &point)| FacePoint::new(point, index))
            .collect();
        Self { model, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn positions(&self) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|p| (p.point.x as f64, p.point.y as f64))
            .collect()
    }

    /// Partition the points into named parts using the model's table
    pub fn parts(&self) -> Result<FacePartMap> {
        let expected = self.model.num_parts();
        if self.points.len() != expected {
            return Err(FaceError::InvalidArgument(format!(
                "{:?} landmarks need {expected} points, got {}",
                self.model,
                self.points.len()
            )));
        }

        let table = part_table(self.model);
        Ok(table
            .into_iter()
            .map(|(part, indices)| {
                let points = indices.into_iter().map(|i| self.points[i]).collect();
                (part, points)
            })
            .collect())
    }
}

fn range(start: usize, end_inclusive: usize) -> Vec<usize> {
    (start..=end_inclusive).collect()
}

fn rev(start: usize, end_inclusive: usize) -> Vec<usize> {
    (start..=end_inclusive).rev().collect()
}

fn concat(parts: &[&[usize]]) -> Vec<usize> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}

/// Index table of every part for a model
pub fn part_table(model: PredictorModel) -> Vec<(FacePart, Vec<usize>)> {
    match model {
        PredictorModel::Large => vec![
            (FacePart::Chin, range(0, 16)),
            (FacePart::LeftEyebrow, range(17, 21)),
            (FacePart::RightEyebrow, range(22, 26)),
            (FacePart::NoseBridge, range(27, 30)),
            (FacePart::NoseTip, range(31, 35)),
            (FacePart::LeftEye, range(36, 41)),
            (FacePart::RightEye, range(42, 47)),
            (FacePart::TopLip, concat(&[&range(48, 54), &[64, 63, 62, 61, 60]])),
            (FacePart::BottomLip, concat(&[&range(54, 59), &[48, 60, 67, 66, 65, 64]])),
        ],
        PredictorModel::Small => vec![
            (FacePart::RightEye, range(0, 1)),
            (FacePart::LeftEye, range(2, 3)),
            (FacePart::NoseTip, vec![4]),
        ],
        PredictorModel::Helen => vec![
            (FacePart::Chin, range(0, 40)),
            (FacePart::LeftEyebrow, range(174, 193)),
            (FacePart::RightEyebrow, range(154, 173)),
            (FacePart::Nose, range(41, 57)),
            (FacePart::LeftEye, range(134, 153)),
            (FacePart::RightEye, range(114, 133)),
            (FacePart::TopLip, concat(&[&range(58, 71), &rev(86, 100)])),
            (FacePart::BottomLip, concat(&[&range(100, 113), &[86, 58], &rev(71, 85)])),
        ],
    }
}

/// Runs the shape predictors over face rectangles.
pub struct LandmarkLocator {
    large: Box<dyn LandmarkPredictor>,
    small: Box<dyn LandmarkPredictor>,
    helen: Option<Box<dyn LandmarkPredictor>>,
}

impl LandmarkLocator {
    pub fn new(
        large: Box<dyn LandmarkPredictor>,
        small: Box<dyn LandmarkPredictor>,
        helen: Option<Box<dyn LandmarkPredictor>>,
    ) -> Result<Self> {
        check_parts(large.as_ref(), PredictorModel::Large)?;
        check_parts(small.as_ref(), PredictorModel::Small)?;
        if let Some(h) = &helen {
            check_parts(h.as_ref(), PredictorModel::Helen)?;
        }
        Ok(Self { large, small, helen })
    }

    pub fn has_model(&self, model: PredictorModel) -> bool {
        model != PredictorModel::Helen || self.helen.is_some()
    }

    fn predictor(&self, model: PredictorModel) -> Result<&dyn LandmarkPredictor> {
        match model {
            PredictorModel::Large => Ok(self.large.as_ref()),
            PredictorModel::Small => Ok(self.small.as_ref()),
            PredictorModel::Helen => self.helen.as_deref().ok_or_else(|| {
                FaceError::InvalidArgument("no Helen predictor was loaded".into())
            }),
        }
    }

    /// Raw landmarks for every location, in input order.
    ///
    /// An empty location list yields an empty result.
    pub fn locate(
        &self,
        image: &Image,
        locations: &[Location],
        model: PredictorModel,
    ) -> Result<Vec<FaceLandmarks>> {
        let predictor = self.predictor(model)?;
        if locations.is_empty() {
            return Ok(Vec::new());
        }

        let gray = image.to_luma8();
        let landmarks: Vec<FaceLandmarks> = locations
            .iter()
            .map(|location| {
                let points = predictor
                    .predict(&gray, location)
                    .into_iter()
                    .enumerate()
                    .map(|(index, (x, y))| FacePoint::new(Point::from_f64(x, y), index))
                    .collect();
                FaceLandmarks::new(model, points)
            })
            .collect();

        debug!("Located {:?} landmarks for {} faces", model, landmarks.len());
        Ok(landmarks)
    }

    /// Landmarks partitioned into named face parts, one map per location
    pub fn locate_parts(
        &self,
        image: &Image,
        locations: &[Location],
        model: PredictorModel,
    ) -> Result<Vec<FacePartMap>> {
        self.locate(image, locations, model)?
            .iter()
            .map(FaceLandmarks::parts)
            .collect()
    }
}

fn check_parts(predictor: &dyn LandmarkPredictor, model: PredictorModel) -> Result<()> {
    if predictor.num_parts() != model.num_parts() {
        return Err(FaceError::InvalidModel(format!(
            "{:?} predictor returns {} points, expected {}",
            model,
            predictor.num_parts(),
            model.num_parts()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    struct GridPredictor(usize);

    impl LandmarkPredictor for GridPredictor {
        fn num_parts(&self) -> usize {
            self.0
        }

        fn predict(&self, _image: &GrayImage, location: &Location) -> Vec<(f64, f64)> {
            (0..self.0)
                .map(|i| (location.left as f64 + i as f64, location.top as f64))
                .collect()
        }
    }

    fn locator() -> LandmarkLocator {
        LandmarkLocator::new(Box::new(GridPredictor(68)), Box::new(GridPredictor(5)), None).unwrap()
    }

    #[test]
    fn test_tables_cover_expected_sizes() {
        let large: usize = part_table(PredictorModel::Large)
            .iter()
            .map(|(_, idx)| idx.len())
            .sum();
        // 68 points plus 4 shared lip corners
        assert_eq!(large, 72);

        let helen = part_table(PredictorModel::Helen);
        let top_lip = &helen.iter().find(|(p, _)| *p == FacePart::TopLip).unwrap().1;
        assert_eq!(top_lip.len(), 29);
        assert_eq!(top_lip[14], 100);
        assert_eq!(*top_lip.last().unwrap(), 86);

        let bottom_lip = &helen.iter().find(|(p, _)| *p == FacePart::BottomLip).unwrap().1;
        assert_eq!(&bottom_lip[14..16], &[86, 58]);
        assert_eq!(*bottom_lip.last().unwrap(), 71);
    }

    #[test]
    fn test_large_parts() {
        let image = Image::from_raw(&[0u8; 100 * 100], 100, 100, crate::engine::Mode::Grayscale).unwrap();
        let maps = locator()
            .locate_parts(&image, &[Location::new(10, 20, 80, 90)], PredictorModel::Large)
            .unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0][&FacePart::Chin].len(), 17);
        assert_eq!(maps[0][&FacePart::TopLip].len(), 12);
        assert_eq!(maps[0][&FacePart::BottomLip][6].index, 48);
        assert_eq!(maps[0][&FacePart::LeftEye][0].point, Point::new(46, 20));
    }

    #[test]
    fn test_small_parts() {
        let landmarks = FaceLandmarks::from_points(PredictorModel::Small, &[Point::new(0, 0); 5]);
        let parts = landmarks.parts().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[&FacePart::NoseTip][0].index, 4);
    }

    #[test]
    fn test_no_locations_no_landmarks() {
        let image = Image::from_raw(&[0u8; 16], 4, 4, crate::engine::Mode::Grayscale).unwrap();
        assert!(locator().locate(&image, &[], PredictorModel::Large).unwrap().is_empty());
    }

    #[test]
    fn test_missing_helen_model() {
        let image = Image::from_raw(&[0u8; 16], 4, 4, crate::engine::Mode::Grayscale).unwrap();
        assert!(!locator().has_model(PredictorModel::Helen));
        assert!(locator()
            .locate(&image, &[Location::new(0, 0, 2, 2)], PredictorModel::Helen)
            .is_err());
    }

    #[test]
    fn test_predictor_size_is_checked() {
        assert!(matches!(
            LandmarkLocator::new(Box::new(GridPredictor(5)), Box::new(GridPredictor(5)), None),
            Err(FaceError::InvalidModel(_))
        ));
    }
}
