//! Geometry value types shared by every stage

use serde::{Deserialize, Serialize};

/// Integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Round a sub-pixel position to the nearest pixel.
    pub fn from_f64(x: f64, y: f64) -> Self {
        Self {
            x: x.round() as i32,
            y: y.round() as i32,
        }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A landmark point together with its position in the raw predictor output.
///
/// The index is the join key used to map points into named face parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacePoint {
    pub point: Point,
    pub index: usize,
}

impl FacePoint {
    pub const fn new(point: Point, index: usize) -> Self {
        Self { point, index }
    }
}

/// Axis-aligned face rectangle in image pixels.
///
/// `right` and `bottom` are exclusive once a location has been trimmed to an
/// image, so `right <= width` and `bottom <= height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    /// Detector score, `None` when the producer does not report one.
    pub confidence: Option<f64>,
}

impl Location {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.left + self.right) as f64 / 2.0,
            (self.top + self.bottom) as f64 / 2.0,
        )
    }

    /// Clamp to `[0, width] x [0, height]`.
    ///
    /// Returns `None` when nothing of the rectangle is left inside the image.
    pub fn trim(&self, width: u32, height: u32) -> Option<Location> {
        let (w, h) = (width as i32, height as i32);
        let trimmed = Location {
            left: self.left.clamp(0, w),
            top: self.top.clamp(0, h),
            right: self.right.clamp(0, w),
            bottom: self.bottom.clamp(0, h),
            confidence: self.confidence,
        };
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_clamps_to_image() {
        let loc = Location::new(-10, -5, 120, 90).with_confidence(0.9);
        let trimmed = loc.trim(100, 80).unwrap();
        assert_eq!(
            (trimmed.left, trimmed.top, trimmed.right, trimmed.bottom),
            (0, 0, 100, 80)
        );
        assert_eq!(trimmed.confidence, Some(0.9));
    }

    #[test]
    fn test_trim_drops_outside_box() {
        assert!(Location::new(150, 10, 200, 40).trim(100, 80).is_none());
        assert!(Location::new(10, 10, 10, 40).trim(100, 80).is_none());
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(0, 0);
        let b = Point::new(3, 4);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
        assert_eq!(Point::from_f64(2.5, -1.4), Point::new(3, -1));
    }
}
