//! Perspective transformation for projection mapping
//!
//! This module implements the perspective (homography) transformation that
//! maps the rectangular source frame onto the operator's quadrilateral, and
//! the back-mapping warp that renders it.

use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, SMatrix, SVector};
use rayon::prelude::*;

/// Relative tolerance for collinearity and singular systems. Inputs are
/// normalized to unit scale first, so this holds across resolutions.
const SINGULAR_EPS: f64 = 1e-10;

/// Slack on the source bounds test for rounding noise in the back-mapping
const EDGE_TOL: f64 = 1e-6;

/// Perspective transformation matrix (3x3 homography)
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveTransform {
    /// Source -> destination, normalized so the bottom-right entry is 1
    matrix: Matrix3<f64>,
    /// Destination -> source, used for back-mapping
    inverse: Matrix3<f64>,
}

impl PerspectiveTransform {
    /// Transform mapping the source rectangle `(0,0)..(width,height)` onto
    /// `dst`, corner for corner in winding order.
    pub fn from_rect(width: u32, height: u32, dst: [(f64, f64); 4]) -> Option<Self> {
        let (w, h) = (width as f64, height as f64);
        Self::compute([(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)], dst)
    }

    /// Compute the perspective transform from 4 source points to 4 destination points.
    ///
    /// Returns `None` when either point set is degenerate (three collinear or
    /// two coincident points), in which case no unique homography exists.
    pub fn compute(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> Option<Self> {
        let (src_n, t_src) = normalize_points(&src)?;
        let (dst_n, t_dst) = normalize_points(&dst)?;

        let hn = solve_homography(&src_n, &dst_n)?;

        // Denormalize: H = T_dst^-1 * Hn * T_src
        let matrix = t_dst.try_inverse()? * hn * t_src;
        let scale = matrix[(2, 2)];
        if scale.abs() < SINGULAR_EPS {
            return None;
        }
        let matrix = matrix / scale;
        let inverse = matrix.try_inverse()?;

        Some(Self { matrix, inverse })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Transform a point from source to destination coordinates
    #[cfg(test)]
    pub fn transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        apply_homography(&self.matrix, x, y)
    }

    /// Transform a point from destination to source coordinates (inverse)
    #[cfg(test)]
    pub fn inverse_transform_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        apply_homography(&self.inverse, x, y)
    }

    /// Warp `src` into `dst` by back-mapping every destination pixel.
    ///
    /// Destination pixels whose source coordinate falls outside
    /// `[0,W]x[0,H]` (or behind the projective horizon) get `background`.
    /// Rows are rendered in parallel.
    pub fn warp_rgb(&self, src: &RgbImage, dst: &mut RgbImage, background: Rgb<u8>) {
        let (src_w, src_h) = src.dimensions();
        let dst_w = dst.width() as usize;
        if dst_w == 0 || src_w == 0 || src_h == 0 {
            for px in dst.pixels_mut() {
                *px = background;
            }
            return;
        }

        let inv = self.inverse;
        let src_raw = src.as_raw();
        let range_x = -EDGE_TOL..=src_w as f64 + EDGE_TOL;
        let range_y = -EDGE_TOL..=src_h as f64 + EDGE_TOL;

        dst.par_chunks_mut(dst_w * 3)
            .enumerate()
            .for_each(|(dst_y, row)| {
                let y = dst_y as f64;
                // Row-constant terms of H^-1 * (x, y, 1)
                let bx = inv[(0, 1)] * y + inv[(0, 2)];
                let by = inv[(1, 1)] * y + inv[(1, 2)];
                let bw = inv[(2, 1)] * y + inv[(2, 2)];

                for (dst_x, out) in row.chunks_exact_mut(3).enumerate() {
                    let x = dst_x as f64;
                    let w = inv[(2, 0)] * x + bw;
                    let pixel = if w > 0.0 {
                        let sx = (inv[(0, 0)] * x + bx) / w;
                        let sy = (inv[(1, 0)] * x + by) / w;
                        if range_x.contains(&sx) && range_y.contains(&sy) {
                            bilinear_sample(src_raw, src_w as usize, src_h as usize, sx, sy)
                        } else {
                            background.0
                        }
                    } else {
                        background.0
                    };
                    out.copy_from_slice(&pixel);
                }
            });
    }
}

/// Translate to the bounding-box origin and scale by its extent, so the
/// solve sees coordinates in [0,1] whatever the surface resolution.
fn normalize_points(pts: &[(f64, f64); 4]) -> Option<([(f64, f64); 4], Matrix3<f64>)> {
    let min_x = pts.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let min_y = pts.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_x = pts.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let max_y = pts.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

    let extent = (max_x - min_x).max(max_y - min_y);
    if !extent.is_finite() || extent <= 0.0 {
        return None;
    }
    let s = 1.0 / extent;

    let mut out = [(0.0, 0.0); 4];
    for (o, p) in out.iter_mut().zip(pts) {
        *o = ((p.0 - min_x) * s, (p.1 - min_y) * s);
    }

    if has_collinear_triple(&out) {
        return None;
    }

    let t = Matrix3::new(s, 0.0, -min_x * s, 0.0, s, -min_y * s, 0.0, 0.0, 1.0);
    Some((out, t))
}

/// True if any three of the (normalized) points are collinear or coincide
fn has_collinear_triple(pts: &[(f64, f64); 4]) -> bool {
    const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    TRIPLES.iter().any(|&(i, j, k)| {
        let (ax, ay) = (pts[j].0 - pts[i].0, pts[j].1 - pts[i].1);
        let (bx, by) = (pts[k].0 - pts[i].0, pts[k].1 - pts[i].1);
        (ax * by - ay * bx).abs() < SINGULAR_EPS
    })
}

/// Solve the 8x8 system for a homography with h33 = 1 from exactly 4
/// point correspondences.
fn solve_homography(src: &[(f64, f64); 4], dst: &[(f64, f64); 4]) -> Option<Matrix3<f64>> {
    // For each correspondence (x,y) -> (x',y'):
    //   h1*x + h2*y + h3 - h7*x*x' - h8*y*x' = x'
    //   h4*x + h5*y + h6 - h7*x*y' - h8*y*y' = y'
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for i in 0..4 {
        let (x, y) = src[i];
        let (xp, yp) = dst[i];
        let r1 = i * 2;
        let r2 = r1 + 1;

        a[(r1, 0)] = x;
        a[(r1, 1)] = y;
        a[(r1, 2)] = 1.0;
        a[(r1, 6)] = -xp * x;
        a[(r1, 7)] = -xp * y;
        b[r1] = xp;

        a[(r2, 3)] = x;
        a[(r2, 4)] = y;
        a[(r2, 5)] = 1.0;
        a[(r2, 6)] = -yp * x;
        a[(r2, 7)] = -yp * y;
        b[r2] = yp;
    }

    let lu = a.lu();
    if lu.determinant().abs() < SINGULAR_EPS {
        return None;
    }
    let h = lu.solve(&b)?;

    Some(Matrix3::new(
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0,
    ))
}

/// Apply a homography matrix to a point
#[cfg(test)]
fn apply_homography(h: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let v = h * nalgebra::Vector3::new(x, y, 1.0);
    if v[2].abs() < SINGULAR_EPS {
        return None;
    }
    Some((v[0] / v[2], v[1] / v[2]))
}

/// Bilinear interpolation sampling of a packed RGB buffer.
///
/// Coordinates in `[W-1, W]` (and likewise for y) reuse the last column/row.
#[inline]
fn bilinear_sample(src: &[u8], width: usize, height: usize, x: f64, y: f64) -> [u8; 3] {
    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let stride = width * 3;
    let mut result = [0u8; 3];

    for (c, out) in result.iter_mut().enumerate() {
        let p00 = src[y0 * stride + x0 * 3 + c] as f64;
        let p10 = src[y0 * stride + x1 * 3 + c] as f64;
        let p01 = src[y1 * stride + x0 * 3 + c] as f64;
        let p11 = src[y1 * stride + x1 * 3 + c] as f64;

        let value = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;

        *out = value.round().clamp(0.0, 255.0) as u8;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
        let scale = expected.0.abs().max(expected.1.abs()).max(1.0);
        assert!(
            (actual.0 - expected.0).abs() / scale < 1e-6
                && (actual.1 - expected.1).abs() / scale < 1e-6,
            "{:?} != {:?}",
            actual,
            expected
        );
    }

    #[test]
    fn test_identity_transform() {
        let t = PerspectiveTransform::from_rect(
            100,
            100,
            [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)],
        )
        .unwrap();

        assert_close(t.transform_point(50.0, 50.0).unwrap(), (50.0, 50.0));
        assert_close(t.inverse_transform_point(25.0, 75.0).unwrap(), (25.0, 75.0));
    }

    #[test]
    fn test_corners_roundtrip() {
        let dst = [(10.0, 10.0), (200.0, 15.0), (190.0, 210.0), (5.0, 195.0)];
        let t = PerspectiveTransform::from_rect(1920, 1080, dst).unwrap();

        let src = [(0.0, 0.0), (1920.0, 0.0), (1920.0, 1080.0), (0.0, 1080.0)];
        for (s, d) in src.iter().zip(dst.iter()) {
            assert_close(t.transform_point(s.0, s.1).unwrap(), *d);
            assert_close(t.inverse_transform_point(d.0, d.1).unwrap(), *s);
        }
    }

    #[test]
    fn test_roundtrip_at_large_scale() {
        let dst = [
            (12_000.5, 8_000.0),
            (31_000.0, 8_500.0),
            (30_500.0, 21_000.0),
            (11_800.0, 20_400.0),
        ];
        let t = PerspectiveTransform::from_rect(3840, 2160, dst).unwrap();
        assert_close(t.transform_point(3840.0, 2160.0).unwrap(), dst[2]);
    }

    #[test]
    fn test_small_quads_are_not_degenerate() {
        // A tiny but well-formed quad must solve; epsilon is relative
        let dst = [(0.0, 0.0), (0.01, 0.0), (0.01, 0.01), (0.0, 0.01)];
        let t = PerspectiveTransform::from_rect(640, 480, dst).unwrap();
        assert_close(t.transform_point(640.0, 0.0).unwrap(), (0.01, 0.0));
    }

    #[test]
    fn test_bow_tie_is_defined() {
        // Self-intersecting but no three corners collinear
        let dst = [(0.0, 0.0), (100.0, 100.0), (100.0, 0.0), (0.0, 100.0)];
        let t = PerspectiveTransform::from_rect(100, 100, dst);
        assert!(t.is_some());
    }

    #[test]
    fn test_collinear_is_degenerate() {
        let dst = [(0.0, 0.0), (50.0, 0.0), (100.0, 0.0), (0.0, 100.0)];
        assert!(PerspectiveTransform::from_rect(100, 100, dst).is_none());
    }

    #[test]
    fn test_coincident_is_degenerate() {
        let dst = [(0.0, 0.0), (0.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        assert!(PerspectiveTransform::from_rect(100, 100, dst).is_none());
    }

    #[test]
    fn test_warp_translation_is_exact() {
        let mut src = RgbImage::new(8, 6);
        for (x, y, px) in src.enumerate_pixels_mut() {
            *px = Rgb([(x * 30) as u8, (y * 40) as u8, 7]);
        }

        let t = PerspectiveTransform::from_rect(
            8,
            6,
            [(3.0, 2.0), (11.0, 2.0), (11.0, 8.0), (3.0, 8.0)],
        )
        .unwrap();

        let mut dst = RgbImage::new(16, 12);
        t.warp_rgb(&src, &mut dst, Rgb([0, 0, 0]));

        for y in 0..6 {
            for x in 0..8 {
                let expected = src.get_pixel(x, y).0;
                let actual = dst.get_pixel(x + 3, y + 2).0;
                for c in 0..3 {
                    assert!((expected[c] as i32 - actual[c] as i32).abs() <= 1);
                }
            }
        }
        // Outside the footprint is background
        assert_eq!(dst.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(dst.get_pixel(15, 11).0, [0, 0, 0]);
    }

    #[test]
    fn test_warp_background_outside_footprint() {
        let src = RgbImage::from_pixel(4, 4, Rgb([200, 100, 50]));
        let t = PerspectiveTransform::from_rect(
            4,
            4,
            [(10.0, 10.0), (20.0, 10.0), (20.0, 20.0), (10.0, 20.0)],
        )
        .unwrap();

        let mut dst = RgbImage::new(32, 32);
        t.warp_rgb(&src, &mut dst, Rgb([1, 2, 3]));

        assert_eq!(dst.get_pixel(5, 5).0, [1, 2, 3]);
        assert_eq!(dst.get_pixel(25, 15).0, [1, 2, 3]);
        assert_eq!(dst.get_pixel(15, 15).0, [200, 100, 50]);
    }

    #[test]
    fn test_bilinear_midpoint() {
        // Two pixels: black, white
        let src = [0u8, 0, 0, 255, 255, 255];
        let mid = bilinear_sample(&src, 2, 1, 0.5, 0.0);
        assert_eq!(mid, [128, 128, 128]);
    }
}
