//! Face alignment onto the canonical 112×112 recognition template.
//!
//! A 4-DOF similarity transform (scale, rotation, translation) is fitted to the
//! five keypoints by least squares, then the crop is produced by inverse
//! bilinear warping.

use crate::types::Keypoints;
use image::{GrayImage, Luma};

/// Reference keypoint positions in a 112×112 aligned crop.
pub const REFERENCE_KEYPOINTS_112: Keypoints = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Side length of the aligned crop in pixels.
pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    fn estimate(src: &Keypoints, dst: &Keypoints) -> Self {
        // Normal equations AᵀA·x = Aᵀb for x = [a, b, tx, ty], two rows per point:
        //   [sx, -sy, 1, 0]·x = dx
        //   [sy,  sx, 0, 1]·x = dy
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (row, target) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * target;
                }
            }
        }

        match solve4(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 },
        }
    }

    /// Map a destination pixel back into source coordinates.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let dx = x - self.tx;
        let dy = y - self.ty;
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting. `None` if the system is singular.
#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample with black outside the image.
fn sample_bilinear(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = image.dimensions();
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let pixel = |px: i64, py: i64| -> f32 {
        if px >= 0 && py >= 0 && px < w as i64 && py < h as i64 {
            image.get_pixel(px as u32, py as u32)[0] as f32
        } else {
            0.0
        }
    };

    pixel(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + pixel(x0 + 1, y0) * fx * (1.0 - fy)
        + pixel(x0, y0 + 1) * (1.0 - fx) * fy
        + pixel(x0 + 1, y0 + 1) * fx * fy
}

/// Stateless face aligner.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aligner;

impl Aligner {
    pub fn new() -> Self {
        Self
    }

    /// Warp the face described by `keypoints` into a 112×112 aligned crop.
    pub fn align(&self, image: &GrayImage, keypoints: &Keypoints) -> GrayImage {
        let transform = Similarity::estimate(keypoints, &REFERENCE_KEYPOINTS_112);

        GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
            let value = transform
                .invert_point(ox as f32, oy as f32)
                .map(|(sx, sy)| sample_bilinear(image, sx, sy))
                .unwrap_or(0.0);
            Luma([value.round().clamp(0.0, 255.0) as u8])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t = Similarity::estimate(&REFERENCE_KEYPOINTS_112, &REFERENCE_KEYPOINTS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-2, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-2, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        // Source keypoints at 2x scale → a ≈ 0.5
        let src: Keypoints = [
            (76.5892, 103.3926),
            (147.0636, 103.0028),
            (112.0504, 143.4732),
            (83.0986, 184.7310),
            (141.4598, 184.4082),
        ];
        let t = Similarity::estimate(&src, &REFERENCE_KEYPOINTS_112);
        assert!((t.a - 0.5).abs() < 0.05, "a = {}, expected ~0.5", t.a);
    }

    #[test]
    fn test_degenerate_keypoints_fall_back_to_identity() {
        let src: Keypoints = [(0.0, 0.0); 5];
        let t = Similarity::estimate(&src, &REFERENCE_KEYPOINTS_112);
        assert_eq!(t, Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 });
    }

    #[test]
    fn test_align_output_size() {
        let image = GrayImage::from_pixel(640, 480, Luma([128]));
        let aligned = Aligner::new().align(&image, &REFERENCE_KEYPOINTS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_align_is_deterministic() {
        let image = GrayImage::from_fn(200, 200, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]));
        let keypoints: Keypoints = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let aligner = Aligner::new();
        assert_eq!(aligner.align(&image, &keypoints), aligner.align(&image, &keypoints));
    }

    #[test]
    fn test_keypoint_lands_on_reference() {
        // A bright patch at the left eye should end up near the reference left eye.
        let mut image = GrayImage::new(200, 200);
        let keypoints: Keypoints = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                image.put_pixel(x, y, Luma([255]));
            }
        }

        let aligned = Aligner::new().align(&image, &keypoints);

        let ref_x = REFERENCE_KEYPOINTS_112[0].0.round() as u32;
        let ref_y = REFERENCE_KEYPOINTS_112[0].1.round() as u32;
        let max_val = (ref_y - 1..=ref_y + 1)
            .flat_map(|y| (ref_x - 1..=ref_x + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }

    #[test]
    fn test_outside_samples_are_black() {
        let image = GrayImage::from_pixel(4, 4, Luma([255]));
        assert_eq!(sample_bilinear(&image, -10.0, -10.0), 0.0);
        assert_eq!(sample_bilinear(&image, 1.0, 1.0), 255.0);
    }
}
