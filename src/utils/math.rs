//! Math utility functions

/// Compute Euclidean distance between two vectors
///
/// Only the common prefix is compared; callers guarantee equal lengths.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    squared_distance(a, b).sqrt()
}

/// Squared Euclidean distance, used where only the ordering matters
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

/// Dot product of two vectors
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Component-wise mean of equally sized vectors
pub fn mean_vector(vectors: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };

    let mut mean = vec![0.0f64; first.len()];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }

    let n = vectors.len() as f64;
    for m in mean.iter_mut() {
        *m /= n;
    }
    mean
}
