use std::sync::Arc;

use facerec::engine::{ClassifierEstimator, KernelHeadPoseEstimator, KernelRegressor};
use facerec::{DetectionModel, FaceError, Gender, Location, PredictorModel, AGE_GROUPS};

mod common;

use common::{gradient_image, recognition, Counters, FixedScores};

const CENTRE: [f32; 4] = [0.25, 0.25, 0.75, 0.75];

fn fixed(scores: &[f32], counters: &Counters) -> Box<FixedScores> {
    Box::new(FixedScores {
        scores: scores.to_vec(),
        calls: Arc::clone(&counters.network_calls),
    })
}

fn constant(value: f64) -> KernelRegressor {
    KernelRegressor {
        gamma: 1.0,
        basis: Vec::new(),
        alpha: Vec::new(),
        bias: value,
    }
}

#[test]
fn estimators_are_unavailable_until_set() {
    let (mut faces, _) = recognition(vec![CENTRE]);
    let image = gradient_image(100, 100, 0);
    let location = Location::new(20, 20, 80, 80);

    assert!(matches!(
        faces.predict_age(&image, &location),
        Err(FaceError::EstimatorNotConfigured(_))
    ));
    assert!(matches!(
        faces.predict_probability_gender(&image, &location),
        Err(FaceError::EstimatorNotConfigured(_))
    ));
    assert!(matches!(
        faces.predict_emotion(&image, &location),
        Err(FaceError::EstimatorNotConfigured(_))
    ));
    let parts = faces
        .face_landmarks(&image, None, PredictorModel::Large, DetectionModel::Fast)
        .unwrap();
    assert!(matches!(
        faces.predict_head_pose(&parts[0]),
        Err(FaceError::EstimatorNotConfigured(_))
    ));
}

#[test]
fn detected_faces_get_age_gender_and_emotion() {
    let (mut faces, counters) = recognition(vec![CENTRE]);
    let before = Counters::get(&counters.network_calls);

    let mut age_scores = [0.0f32; 8];
    age_scores[4] = 3.0;
    faces.set_age_estimator(Box::new(ClassifierEstimator::age(fixed(&age_scores, &counters))));
    faces.set_gender_estimator(Box::new(ClassifierEstimator::gender(fixed(&[2.0, -1.0], &counters))));
    let labels = vec!["calm".to_string(), "upset".to_string()];
    faces.set_emotion_estimator(Box::new(
        ClassifierEstimator::emotion(fixed(&[0.0, 1.0], &counters), labels).unwrap(),
    ));

    let image = gradient_image(160, 120, 0);
    let location = faces.face_locations(&image, 0, DetectionModel::Fast).unwrap()[0];

    let age = faces.predict_age(&image, &location).unwrap();
    assert_eq!(AGE_GROUPS[age as usize].start, 25);
    let ages = faces.predict_probability_age(&image, &location).unwrap();
    assert_eq!(ages.keys().copied().collect::<Vec<_>>(), (0..8).collect::<Vec<u32>>());

    assert_eq!(faces.predict_gender(&image, &location).unwrap(), Gender::Male);
    let genders = faces.predict_probability_gender(&image, &location).unwrap();
    assert!(genders[&Gender::Male] > 0.9);

    assert_eq!(faces.predict_emotion(&image, &location).unwrap(), "upset");
    let emotions = faces.predict_probability_emotion(&image, &location).unwrap();
    assert!((emotions.values().sum::<f32>() - 1.0).abs() < 1e-6);

    assert_eq!(Counters::get(&counters.network_calls) - before, 6);
}

#[test]
fn head_pose_needs_large_landmarks() {
    let (mut faces, _) = recognition(vec![CENTRE]);
    let estimator = KernelHeadPoseEstimator::new(constant(1.5), constant(-2.0), constant(10.0)).unwrap();
    faces.set_head_pose_estimator(Box::new(estimator));
    let image = gradient_image(200, 200, 0);

    let large = faces
        .face_landmarks(&image, None, PredictorModel::Large, DetectionModel::Fast)
        .unwrap();
    let pose = faces.predict_head_pose(&large[0]).unwrap();
    assert_eq!((pose.roll, pose.pitch, pose.yaw), (1.5, -2.0, 10.0));

    let small = faces
        .face_landmarks(&image, None, PredictorModel::Small, DetectionModel::Fast)
        .unwrap();
    assert!(matches!(
        faces.predict_head_pose(&small[0]),
        Err(FaceError::InvalidArgument(_))
    ));
}
