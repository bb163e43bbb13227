//! Ensemble-of-regression-trees shape predictor
//!
//! Reads dlib's `shape_predictor` serialization and runs the cascade on a
//! grayscale image. Each cascade stage samples a fixed set of pixels placed
//! relative to the current shape estimate, and every tree in the stage adds
//! the leaf selected by pairwise pixel differences.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;

use image::GrayImage;
use tracing::info;

use super::preprocess::SimilarityTransform;
use crate::error::{FaceError, Result};
use crate::geometry::Location;

/// A callable that places landmarks inside a face rectangle.
pub trait LandmarkPredictor: Send {
    /// Number of points returned by [`LandmarkPredictor::predict`]
    fn num_parts(&self) -> usize;

    /// Landmark positions in image pixels, in predictor order
    fn predict(&self, image: &GrayImage, location: &Location) -> Vec<(f64, f64)>;
}

// Upper bound for pre-allocation while reading untrusted lengths
const MAX_PREALLOC: usize = 1 << 16;

/// Reader for dlib's portable binary encoding.
///
/// Integers: control byte (high bit = sign, low 4 bits = byte count) then the
/// magnitude in little-endian order. Floats are a (mantissa, exponent) pair.
struct DlibReader<R: Read> {
    reader: R,
}

impl<R: Read> DlibReader<R> {
    fn new(reader: R) -> Self {
        Self { reader }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_int(&mut self) -> Result<i64> {
        let control = self.read_byte()?;
        let is_negative = (control & 0x80) != 0;
        let num_bytes = (control & 0x0F) as usize;
        if num_bytes > 8 {
            return Err(FaceError::InvalidModel(format!(
                "integer field of {num_bytes} bytes"
            )));
        }

        let mut val: u64 = 0;
        for i in 0..num_bytes {
            val |= (self.read_byte()? as u64) << (8 * i);
        }

        let signed = val as i64;
        Ok(if is_negative { -signed } else { signed })
    }

    fn read_len(&mut self) -> Result<usize> {
        let val = self.read_int()?;
        usize::try_from(val)
            .map_err(|_| FaceError::InvalidModel(format!("expected a length, got {val}")))
    }

    fn read_float(&mut self) -> Result<f32> {
        let mantissa = self.read_int()?;
        let exponent = self.read_int()?;
        if mantissa == 0 {
            return Ok(0.0);
        }
        Ok((mantissa as f64 * 2f64.powi(exponent as i32)) as f32)
    }

    /// Column vector stored as (-rows, -cols, data...)
    fn read_column(&mut self) -> Result<Vec<f32>> {
        let rows = -self.read_int()?;
        let cols = -self.read_int()?;
        if rows < 0 || cols != 1 {
            return Err(FaceError::InvalidModel(format!(
                "expected a column vector, got {rows}x{cols}"
            )));
        }

        let len = rows as usize;
        let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));
        for _ in 0..len {
            data.push(self.read_float()?);
        }
        Ok(data)
    }
}

#[derive(Debug, Clone)]
struct Split {
    idx1: usize,
    idx2: usize,
    thresh: f32,
}

#[derive(Debug, Clone)]
struct RegressionTree {
    splits: Vec<Split>,
    leaf_values: Vec<Vec<f32>>,
}

impl RegressionTree {
    /// Leaf selected by the sampled pixels.
    ///
    /// Node `i` goes to `2i + 1` when the pixel difference exceeds the
    /// threshold and to `2i + 2` otherwise.
    fn leaf(&self, pixels: &[f32]) -> &[f32] {
        let mut i = 0;
        while i < self.splits.len() {
            let split = &self.splits[i];
            i = if pixels[split.idx1] - pixels[split.idx2] > split.thresh {
                2 * i + 1
            } else {
                2 * i + 2
            };
        }
        &self.leaf_values[i - self.splits.len()]
    }
}

/// One cascade stage: its trees and the pixels they sample.
#[derive(Debug, Clone)]
struct Stage {
    trees: Vec<RegressionTree>,
    anchor_idx: Vec<usize>,
    deltas: Vec<(f32, f32)>,
}

/// dlib-compatible shape predictor.
#[derive(Debug, Clone)]
pub struct ShapePredictor {
    initial_shape: Vec<(f32, f32)>,
    stages: Vec<Stage>,
}

impl ShapePredictor {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading shape predictor from {}", path.display());
        let start = Instant::now();

        let reader = BufReader::new(File::open(path)?);
        let predictor = Self::from_reader(reader)?;

        info!(
            "Shape predictor loaded in {:?}: {} parts, {} stages",
            start.elapsed(),
            predictor.num_parts(),
            predictor.stages.len()
        );
        Ok(predictor)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut r = DlibReader::new(reader);

        let version = r.read_int()?;
        if version != 1 {
            return Err(FaceError::InvalidModel(format!(
                "unsupported shape_predictor version {version}"
            )));
        }

        let initial = r.read_column()?;
        if initial.is_empty() || initial.len() % 2 != 0 {
            return Err(FaceError::InvalidModel(format!(
                "initial shape has {} values",
                initial.len()
            )));
        }
        let num_values = initial.len();
        let initial_shape: Vec<(f32, f32)> = initial.chunks_exact(2).map(|c| (c[0], c[1])).collect();

        let num_forests = r.read_len()?;
        let mut forests = Vec::with_capacity(num_forests.min(MAX_PREALLOC));
        for _ in 0..num_forests {
            let num_trees = r.read_len()?;
            let mut trees = Vec::with_capacity(num_trees.min(MAX_PREALLOC));
            for _ in 0..num_trees {
                trees.push(read_tree(&mut r, num_values)?);
            }
            forests.push(trees);
        }

        let num_anchor_sets = r.read_len()?;
        let mut anchor_sets = Vec::with_capacity(num_anchor_sets.min(MAX_PREALLOC));
        for _ in 0..num_anchor_sets {
            let n = r.read_len()?;
            let mut anchors = Vec::with_capacity(n.min(MAX_PREALLOC));
            for _ in 0..n {
                anchors.push(r.read_len()?);
            }
            anchor_sets.push(anchors);
        }

        let num_delta_sets = r.read_len()?;
        let mut delta_sets = Vec::with_capacity(num_delta_sets.min(MAX_PREALLOC));
        for _ in 0..num_delta_sets {
            let n = r.read_len()?;
            let mut deltas = Vec::with_capacity(n.min(MAX_PREALLOC));
            for _ in 0..n {
                let dx = r.read_float()?;
                let dy = r.read_float()?;
                deltas.push((dx, dy));
            }
            delta_sets.push(deltas);
        }

        if anchor_sets.len() != forests.len() || delta_sets.len() != forests.len() {
            return Err(FaceError::InvalidModel(format!(
                "{} forests but {} anchor sets and {} delta sets",
                forests.len(),
                anchor_sets.len(),
                delta_sets.len()
            )));
        }

        let stages = forests
            .into_iter()
            .zip(anchor_sets)
            .zip(delta_sets)
            .map(|((trees, anchor_idx), deltas)| Stage {
                trees,
                anchor_idx,
                deltas,
            })
            .collect();

        Self::new(initial_shape, stages)
    }

    fn new(initial_shape: Vec<(f32, f32)>, stages: Vec<Stage>) -> Result<Self> {
        let num_parts = initial_shape.len();
        for (s, stage) in stages.iter().enumerate() {
            if stage.anchor_idx.len() != stage.deltas.len() {
                return Err(FaceError::InvalidModel(format!(
                    "stage {s}: {} anchors for {} deltas",
                    stage.anchor_idx.len(),
                    stage.deltas.len()
                )));
            }
            if stage.anchor_idx.iter().any(|&a| a >= num_parts) {
                return Err(FaceError::InvalidModel(format!(
                    "stage {s}: anchor outside a {num_parts} point shape"
                )));
            }
            let num_pixels = stage.deltas.len();
            for tree in &stage.trees {
                if tree.splits.iter().any(|sp| sp.idx1 >= num_pixels || sp.idx2 >= num_pixels) {
                    return Err(FaceError::InvalidModel(format!(
                        "stage {s}: split references a pixel outside {num_pixels}"
                    )));
                }
            }
        }

        Ok(Self {
            initial_shape,
            stages,
        })
    }

    pub fn num_parts(&self) -> usize {
        self.initial_shape.len()
    }

    /// Sample the stage's pixels around the current shape.
    ///
    /// Offsets are stored relative to the initial shape, so they follow the
    /// rotation and scale that take the initial shape onto the current one.
    fn sample_pixels(
        &self,
        stage: &Stage,
        image: &GrayImage,
        rect: &Location,
        current: &[(f32, f32)],
        tform: &SimilarityTransform,
    ) -> Vec<f32> {
        let (w, h) = (image.width() as i64, image.height() as i64);
        let (rw, rh) = (rect.width() as f64, rect.height() as f64);

        stage
            .anchor_idx
            .iter()
            .zip(&stage.deltas)
            .map(|(&anchor, &(dx, dy))| {
                let (ox, oy) = tform.apply_linear((dx as f64, dy as f64));
                let (ax, ay) = current[anchor];
                let nx = ox + ax as f64;
                let ny = oy + ay as f64;

                let px = (rect.left as f64 + nx * rw).round() as i64;
                let py = (rect.top as f64 + ny * rh).round() as i64;
                if px >= 0 && py >= 0 && px < w && py < h {
                    image.get_pixel(px as u32, py as u32)[0] as f32
                } else {
                    0.0
                }
            })
            .collect()
    }
}

impl LandmarkPredictor for ShapePredictor {
    fn num_parts(&self) -> usize {
        ShapePredictor::num_parts(self)
    }

    fn predict(&self, image: &GrayImage, location: &Location) -> Vec<(f64, f64)> {
        let initial: Vec<(f64, f64)> = self
            .initial_shape
            .iter()
            .map(|&(x, y)| (x as f64, y as f64))
            .collect();
        let mut current = self.initial_shape.clone();

        for stage in &self.stages {
            let current_f64: Vec<(f64, f64)> =
                current.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
            let tform = SimilarityTransform::estimate(&initial, &current_f64)
                .unwrap_or_else(|_| SimilarityTransform::identity());

            let pixels = self.sample_pixels(stage, image, location, &current, &tform);
            for tree in &stage.trees {
                let leaf = tree.leaf(&pixels);
                for (point, delta) in current.iter_mut().zip(leaf.chunks_exact(2)) {
                    point.0 += delta[0];
                    point.1 += delta[1];
                }
            }
        }

        let (rw, rh) = (location.width() as f64, location.height() as f64);
        current
            .into_iter()
            .map(|(x, y)| {
                (
                    location.left as f64 + x as f64 * rw,
                    location.top as f64 + y as f64 * rh,
                )
            })
            .collect()
    }
}

fn read_tree<R: Read>(r: &mut DlibReader<R>, num_values: usize) -> Result<RegressionTree> {
    let num_splits = r.read_len()?;
    let mut splits = Vec::with_capacity(num_splits.min(MAX_PREALLOC));
    for _ in 0..num_splits {
        let idx1 = r.read_len()?;
        let idx2 = r.read_len()?;
        let thresh = r.read_float()?;
        splits.push(Split { idx1, idx2, thresh });
    }

    let num_leaves = r.read_len()?;
    if num_leaves != num_splits + 1 {
        return Err(FaceError::InvalidModel(format!(
            "tree with {num_splits} splits has {num_leaves} leaves"
        )));
    }

    let mut leaf_values = Vec::with_capacity(num_leaves.min(MAX_PREALLOC));
    for _ in 0..num_leaves {
        let leaf = r.read_column()?;
        if leaf.len() != num_values {
            return Err(FaceError::InvalidModel(format!(
                "leaf has {} values, expected {num_values}",
                leaf.len()
            )));
        }
        leaf_values.push(leaf);
    }

    Ok(RegressionTree {
        splits,
        leaf_values,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;
    use std::io::Cursor;

    pub(crate) fn write_int(v: &mut Vec<u8>, val: i64) {
        if val == 0 {
            v.push(0x00);
            return;
        }
        let abs = val.unsigned_abs();
        let num_bytes = (8 - abs.leading_zeros() as usize / 8).max(1);
        v.push(if val < 0 { 0x80 } else { 0x00 } | num_bytes as u8);
        for i in 0..num_bytes {
            v.push(((abs >> (8 * i)) & 0xFF) as u8);
        }
    }

    // Values used in tests are exact multiples of 1/1024
    pub(crate) fn write_float(v: &mut Vec<u8>, val: f32) {
        write_int(v, (val as f64 * 1024.0).round() as i64);
        write_int(v, -10);
    }

    pub(crate) fn write_column(v: &mut Vec<u8>, values: &[f32]) {
        write_int(v, -(values.len() as i64));
        write_int(v, -1);
        for &x in values {
            write_float(v, x);
        }
    }

    /// A single-stage model with one split comparing two pixels.
    ///
    /// Pixel 0 sits on part 0, pixel 1 on part 1. When pixel 0 is brighter by
    /// more than 10 every point moves by `+0.125` in x, otherwise by `-0.125`.
    pub(crate) fn tiny_model_bytes(shape: &[(f32, f32)]) -> Vec<u8> {
        let n = shape.len() * 2;
        let flat: Vec<f32> = shape.iter().flat_map(|&(x, y)| [x, y]).collect();

        let mut v = Vec::new();
        write_int(&mut v, 1);
        write_column(&mut v, &flat);

        write_int(&mut v, 1); // forests
        write_int(&mut v, 1); // trees
        write_int(&mut v, 1); // splits
        write_int(&mut v, 0);
        write_int(&mut v, 1);
        write_float(&mut v, 10.0);
        write_int(&mut v, 2); // leaves
        let left: Vec<f32> = (0..n).map(|i| if i % 2 == 0 { 0.125 } else { 0.0 }).collect();
        let right: Vec<f32> = left.iter().map(|x| -x).collect();
        write_column(&mut v, &left);
        write_column(&mut v, &right);

        write_int(&mut v, 1); // anchor sets
        write_int(&mut v, 2);
        write_int(&mut v, 0);
        write_int(&mut v, 1);

        write_int(&mut v, 1); // delta sets
        write_int(&mut v, 2);
        for _ in 0..4 {
            write_float(&mut v, 0.0);
        }
        v
    }

    #[test]
    fn test_read_varint() {
        let mut data = Vec::new();
        for val in [0, 1, 127, 128, 255, 256, -1, -128, 70000] {
            write_int(&mut data, val);
        }
        let mut reader = DlibReader::new(Cursor::new(data));
        for val in [0, 1, 127, 128, 255, 256, -1, -128, 70000] {
            assert_eq!(reader.read_int().unwrap(), val);
        }
    }

    #[test]
    fn test_read_float() {
        let mut data = Vec::new();
        write_float(&mut data, 0.5);
        write_float(&mut data, -2.25);
        let mut reader = DlibReader::new(Cursor::new(data));
        assert_eq!(reader.read_float().unwrap(), 0.5);
        assert_eq!(reader.read_float().unwrap(), -2.25);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut data = Vec::new();
        write_int(&mut data, 2);
        assert!(matches!(
            ShapePredictor::from_reader(Cursor::new(data)),
            Err(FaceError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_truncated_model_is_an_error() {
        let bytes = tiny_model_bytes(&[(0.25, 0.5), (0.75, 0.5)]);
        assert!(ShapePredictor::from_reader(Cursor::new(&bytes[..bytes.len() - 3])).is_err());
    }

    #[test]
    fn test_predict_follows_pixel_difference() {
        let shape = [(0.25, 0.5), (0.75, 0.5)];
        let model = ShapePredictor::from_reader(Cursor::new(tiny_model_bytes(&shape))).unwrap();
        assert_eq!(LandmarkPredictor::num_parts(&model), 2);

        let rect = Location::new(0, 0, 100, 100);

        // Left half bright: pixel at part 0 is brighter, tree goes left
        let bright_left = GrayImage::from_fn(100, 100, |x, _| Luma([if x < 50 { 200 } else { 0 }]));
        let points = model.predict(&bright_left, &rect);
        assert!((points[0].0 - 37.5).abs() < 1e-6);
        assert!((points[1].0 - 87.5).abs() < 1e-6);
        assert!((points[0].1 - 50.0).abs() < 1e-6);

        // Uniform image: difference is 0, tree goes right
        let flat = GrayImage::from_pixel(100, 100, Luma([90]));
        let points = model.predict(&flat, &rect);
        assert!((points[0].0 - 12.5).abs() < 1e-6);
        assert!((points[1].0 - 62.5).abs() < 1e-6);
    }
}
