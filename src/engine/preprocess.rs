//! Image preprocessing for detection, alignment and descriptor extraction

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use rand::Rng;

use crate::error::{FaceError, Result};
use crate::geometry::Location;

/// Side length of an aligned face chip
pub const CHIP_SIZE: u32 = 150;

/// Border added around the mean face shape when cutting a chip
pub const CHIP_PADDING: f64 = 0.25;

/// Per-channel RGB means subtracted before the descriptor network
pub const DESCRIPTOR_CHANNEL_MEANS: [f32; 3] = [122.782, 117.001, 104.298];

/// Accurate detector input sides must be a multiple of this
pub const DETECTOR_STRIDE_ALIGN: u32 = 32;

// Mean face shape for landmarks 17..=67 in unit coordinates.
const MEAN_FACE_SHAPE_X: [f64; 51] = [
    0.000213256, 0.0752622, 0.18113, 0.29077, 0.393397, 0.586856, 0.689483, 0.799124, 0.904991,
    0.98004, 0.490127, 0.490127, 0.490127, 0.490127, 0.36688, 0.426036, 0.490127, 0.554217,
    0.613373, 0.121737, 0.187122, 0.265825, 0.334606, 0.260918, 0.182743, 0.645647, 0.714428,
    0.793132, 0.858516, 0.79751, 0.719335, 0.254149, 0.340985, 0.428858, 0.490127, 0.551395,
    0.639268, 0.726104, 0.642159, 0.556721, 0.490127, 0.423532, 0.338094, 0.290379, 0.428096,
    0.490127, 0.552157, 0.689874, 0.553364, 0.490127, 0.42689,
];

const MEAN_FACE_SHAPE_Y: [f64; 51] = [
    0.106454, 0.038915, 0.0187482, 0.0344891, 0.0773906, 0.0773906, 0.0344891, 0.0187482,
    0.038915, 0.106454, 0.203352, 0.307009, 0.409805, 0.515625, 0.587326, 0.609345, 0.628106,
    0.609345, 0.587326, 0.216423, 0.178758, 0.179852, 0.231733, 0.245099, 0.244077, 0.231733,
    0.179852, 0.178758, 0.216423, 0.244077, 0.245099, 0.780233, 0.745405, 0.727388, 0.742578,
    0.727388, 0.745405, 0.780233, 0.864805, 0.902192, 0.909281, 0.902192, 0.864805, 0.784792,
    0.778746, 0.785343, 0.778746, 0.784792, 0.824182, 0.831803, 0.824182,
];

// Mean-shape landmarks matched by the five point predictor, in its output order.
const SMALL_MODEL_ANCHORS: [usize; 5] = [45, 42, 36, 39, 33];

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image))
}

/// Apply EXIF orientation to correct image rotation
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // See https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Double width and height with bilinear interpolation
pub fn pyramid_up(image: &DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    image.resize_exact(w * 2, h * 2, FilterType::Triangle)
}

/// Copy the image into a zero canvas whose sides are multiples of `multiple`.
///
/// Content stays anchored at the top-left so detections need no remapping.
pub fn pad_to_multiple(rgb: &RgbImage, multiple: u32) -> RgbImage {
    let (w, h) = rgb.dimensions();
    let padded_w = w.div_ceil(multiple) * multiple;
    let padded_h = h.div_ceil(multiple) * multiple;
    if padded_w == w && padded_h == h {
        return rgb.clone();
    }

    let mut padded = ImageBuffer::from_pixel(padded_w, padded_h, Rgb([0u8, 0, 0]));
    image::imageops::replace(&mut padded, rgb, 0, 0);
    padded
}

/// Stack equally sized images into one detector tensor.
///
/// BGR order, normalized to [-1, 1].
pub fn detection_tensor(images: &[RgbImage]) -> Result<Array4<f32>> {
    let (width, height) = match images.first() {
        Some(first) => first.dimensions(),
        None => return Err(FaceError::InvalidArgument("empty detection batch".into())),
    };

    let mut tensor = Array4::<f32>::zeros((images.len(), 3, height as usize, width as usize));
    for (n, rgb) in images.iter().enumerate() {
        if rgb.dimensions() != (width, height) {
            return Err(FaceError::BatchDimensionMismatch {
                index: n,
                expected: (width, height),
                actual: rgb.dimensions(),
            });
        }
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
            tensor[[n, 0, y as usize, x as usize]] = (b - 127.5) / 128.0;
            tensor[[n, 1, y as usize, x as usize]] = (g - 127.5) / 128.0;
            tensor[[n, 2, y as usize, x as usize]] = (r - 127.5) / 128.0;
        }
    }

    Ok(tensor)
}

/// Stack face chips into one descriptor tensor: RGB, mean-subtracted, divided by 256
pub fn chips_to_nchw(chips: &[RgbImage]) -> Array4<f32> {
    let (width, height) = chips.first().map(|c| c.dimensions()).unwrap_or((0, 0));
    let mut tensor = Array4::<f32>::zeros((chips.len(), 3, height as usize, width as usize));

    for (n, chip) in chips.iter().enumerate() {
        for (x, y, pixel) in chip.enumerate_pixels() {
            for c in 0..3 {
                tensor[[n, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - DESCRIPTOR_CHANNEL_MEANS[c]) / 256.0;
            }
        }
    }

    tensor
}

/// Crop a rectangle that is already trimmed to the image
pub fn crop(image: &DynamicImage, location: &Location) -> DynamicImage {
    image.crop_imm(
        location.left.max(0) as u32,
        location.top.max(0) as u32,
        location.width().max(0) as u32,
        location.height().max(0) as u32,
    )
}

/// 2-D similarity transform: `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn apply(&self, (x, y): (f64, f64)) -> (f64, f64) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Rotation-scale part only, no translation
    pub fn apply_linear(&self, (x, y): (f64, f64)) -> (f64, f64) {
        (self.a * x - self.b * y, self.b * x + self.a * y)
    }

    pub fn scale(&self) -> f64 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    /// Least-squares similarity mapping `src` onto `dst`.
    ///
    /// Umeyama's method restricted to proper rotations. With the 2x2 cross
    /// covariance `[[p, q], [r, s]]` the optimal rotation angle is
    /// `atan2(r - q, p + s)` and the scale is its norm over the source variance.
    pub fn estimate(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Result<Self> {
        if src.len() != dst.len() || src.len() < 2 {
            return Err(FaceError::InvalidArgument(format!(
                "similarity transform needs two matching point sets, got {} and {}",
                src.len(),
                dst.len()
            )));
        }

        let n = src.len() as f64;
        let (mut src_cx, mut src_cy, mut dst_cx, mut dst_cy) = (0.0, 0.0, 0.0, 0.0);
        for (s, d) in src.iter().zip(dst) {
            src_cx += s.0;
            src_cy += s.1;
            dst_cx += d.0;
            dst_cy += d.1;
        }
        src_cx /= n;
        src_cy /= n;
        dst_cx /= n;
        dst_cy /= n;

        let mut var_src = 0.0;
        let (mut sigma_00, mut sigma_01, mut sigma_10, mut sigma_11) = (0.0, 0.0, 0.0, 0.0);
        for (s, d) in src.iter().zip(dst) {
            let sx = s.0 - src_cx;
            let sy = s.1 - src_cy;
            let dx = d.0 - dst_cx;
            let dy = d.1 - dst_cy;

            var_src += sx * sx + sy * sy;
            sigma_00 += dx * sx;
            sigma_01 += dx * sy;
            sigma_10 += dy * sx;
            sigma_11 += dy * sy;
        }

        if var_src <= 1e-12 {
            return Err(FaceError::InvalidArgument(
                "source points are degenerate".into(),
            ));
        }

        let e = sigma_00 + sigma_11;
        let h = sigma_10 - sigma_01;
        let norm = (e * e + h * h).sqrt();
        let scale = norm / var_src;
        let angle = h.atan2(e);

        let a = scale * angle.cos();
        let b = scale * angle.sin();
        let tx = dst_cx - (a * src_cx - b * src_cy);
        let ty = dst_cy - (b * src_cx + a * src_cy);

        Ok(Self { a, b, tx, ty })
    }
}

/// Resample `rgb` through a transform mapping output pixels to input pixels.
///
/// Bilinear interpolation; samples falling outside the source stay black.
pub fn warp_similarity(
    rgb: &RgbImage,
    output_to_input: &SimilarityTransform,
    out_width: u32,
    out_height: u32,
) -> RgbImage {
    let mut output = ImageBuffer::from_pixel(out_width, out_height, Rgb([0u8, 0, 0]));
    let (w, h) = rgb.dimensions();
    if w < 2 || h < 2 {
        return output;
    }

    for y in 0..out_height {
        for x in 0..out_width {
            let (src_x, src_y) = output_to_input.apply((x as f64, y as f64));

            if src_x >= 0.0 && src_x < (w - 1) as f64 && src_y >= 0.0 && src_y < (h - 1) as f64 {
                let x0 = src_x as u32;
                let y0 = src_y as u32;
                let fx = src_x - x0 as f64;
                let fy = src_y - y0 as f64;

                let p00 = rgb.get_pixel(x0, y0);
                let p01 = rgb.get_pixel(x0, y0 + 1);
                let p10 = rgb.get_pixel(x0 + 1, y0);
                let p11 = rgb.get_pixel(x0 + 1, y0 + 1);

                let mut pixel = [0u8; 3];
                for c in 0..3 {
                    let v = p00[c] as f64 * (1.0 - fx) * (1.0 - fy)
                        + p10[c] as f64 * fx * (1.0 - fy)
                        + p01[c] as f64 * (1.0 - fx) * fy
                        + p11[c] as f64 * fx * fy;
                    pixel[c] = v.round().clamp(0.0, 255.0) as u8;
                }

                output.put_pixel(x, y, Rgb(pixel));
            }
        }
    }

    output
}

/// Chip-space target positions for a landmark set of the given size.
///
/// Returns the landmark indices that take part in the alignment together
/// with their target positions, or `None` for unsupported point counts.
pub fn chip_targets(point_count: usize, size: u32, padding: f64) -> Option<Vec<(usize, (f64, f64))>> {
    let to_chip = |mean_index: usize| {
        let i = mean_index - 17;
        let scale = size as f64 / (2.0 * padding + 1.0);
        (
            (MEAN_FACE_SHAPE_X[i] + padding) * scale,
            (MEAN_FACE_SHAPE_Y[i] + padding) * scale,
        )
    };

    match point_count {
        68 => Some((17..68).map(|i| (i, to_chip(i))).collect()),
        5 => Some(
            SMALL_MODEL_ANCHORS
                .iter()
                .enumerate()
                .map(|(i, &anchor)| (i, to_chip(anchor)))
                .collect(),
        ),
        _ => None,
    }
}

/// Cut a canonical-pose face chip out of `rgb`.
///
/// `landmarks` must hold 68 or 5 points.
pub fn extract_face_chip(
    rgb: &RgbImage,
    landmarks: &[(f64, f64)],
    size: u32,
    padding: f64,
) -> Result<RgbImage> {
    let targets = chip_targets(landmarks.len(), size, padding).ok_or_else(|| {
        FaceError::InvalidArgument(format!("cannot align {} landmarks", landmarks.len()))
    })?;

    let chip_points: Vec<(f64, f64)> = targets.iter().map(|(_, p)| *p).collect();
    let image_points: Vec<(f64, f64)> = targets.iter().map(|(i, _)| landmarks[*i]).collect();

    // Backward mapping: chip pixel -> image pixel
    let chip_to_image = SimilarityTransform::estimate(&chip_points, &image_points)?;
    Ok(warp_similarity(rgb, &chip_to_image, size, size))
}

/// One randomized augmentation of an aligned chip.
///
/// Recentres the crop by up to 2% of its size, scales it by a factor in
/// [0.97, 0.99999], rotates by up to 3 degrees and mirrors it half the time.
pub fn jitter_chip<R: Rng + ?Sized>(chip: &RgbImage, rng: &mut R) -> RgbImage {
    const MAX_ROTATION_DEGREES: f64 = 3.0;
    const MIN_OBJECT_HEIGHT: f64 = 0.97;
    const MAX_OBJECT_HEIGHT: f64 = 0.99999;
    const TRANSLATE_AMOUNT: f64 = 0.02;

    let (w, h) = chip.dimensions();
    let side = w.max(h) as f64;

    let shift_x = rng.gen_range(-TRANSLATE_AMOUNT..=TRANSLATE_AMOUNT) * side;
    let shift_y = rng.gen_range(-TRANSLATE_AMOUNT..=TRANSLATE_AMOUNT) * side;
    let scale_perturb = rng.gen_range(MIN_OBJECT_HEIGHT..=MAX_OBJECT_HEIGHT);
    let angle = rng.gen_range(-MAX_ROTATION_DEGREES..=MAX_ROTATION_DEGREES).to_radians();
    let flip = rng.gen_bool(0.5);

    let box_scale = 1.0 / scale_perturb;
    let (cx, cy) = ((w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);

    // Output centre maps to the shifted crop centre, then rotate and scale
    let a = box_scale * angle.cos();
    let b = box_scale * angle.sin();
    let transform = SimilarityTransform {
        a,
        b,
        tx: cx + shift_x - (a * cx - b * cy),
        ty: cy + shift_y - (b * cx + a * cy),
    };

    let jittered = warp_similarity(chip, &transform, w, h);
    if flip {
        image::imageops::flip_horizontal(&jittered)
    } else {
        jittered
    }
}
