//! Pairwise comparison of face encodings

use crate::encoding::FaceEncoding;
use crate::utils::math::euclidean_distance;

/// Distance at or below which two encodings are considered the same person
pub const DEFAULT_TOLERANCE: f64 = 0.6;

/// Euclidean distance between two encodings.
///
/// If either side is the zero-length "no face" sentinel the distance is `0`,
/// which is indistinguishable from a perfect match. Callers that may hold
/// sentinel encodings must check [`FaceEncoding::is_empty`] themselves.
pub fn face_distance(a: &FaceEncoding, b: &FaceEncoding) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    euclidean_distance(a.values(), b.values())
}

/// Distance from every known encoding to the candidate, in input order
pub fn face_distances(known: &[FaceEncoding], candidate: &FaceEncoding) -> Vec<f64> {
    known
        .iter()
        .map(|encoding| face_distance(encoding, candidate))
        .collect()
}

pub fn compare_face(known: &FaceEncoding, candidate: &FaceEncoding, tolerance: f64) -> bool {
    face_distance(known, candidate) <= tolerance
}

/// Elementwise `distance(known[i], candidate) <= tolerance`
pub fn compare_faces(known: &[FaceEncoding], candidate: &FaceEncoding, tolerance: f64) -> Vec<bool> {
    face_distances(known, candidate)
        .into_iter()
        .map(|d| d <= tolerance)
        .collect()
}
