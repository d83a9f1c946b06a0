//! Warp engine: memoized source-to-quad transform and output frame rendering

use image::{Rgb, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::config::{Point, Rect};
use crate::quad::Quad;
use crate::transform::PerspectiveTransform;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WarpError {
    /// No unique homography: three or more corners collinear, or two coincide
    #[error("degenerate quad: corners are collinear or coincident")]
    DegenerateQuad,
}

/// A rendered frame sized to the active display surface
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFrame {
    image: RgbImage,
}

impl OutputFrame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn filled(width: u32, height: u32, color: Rgb<u8>) -> Self {
        Self::new(RgbImage::from_pixel(width, height, color))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }
}

/// What the cached transform was computed from
#[derive(Debug, Clone, Copy, PartialEq)]
struct CacheKey {
    revision: u64,
    corners: [Point; 4],
    src_width: u32,
    src_height: u32,
}

impl CacheKey {
    fn new(quad: &Quad, (src_width, src_height): (u32, u32)) -> Self {
        Self {
            revision: quad.revision(),
            corners: quad.corners(),
            src_width,
            src_height,
        }
    }
}

/// Produces warped output frames from source frames and the current quad.
///
/// The homography is solved only when the quad or the source dimensions
/// change; every other frame reuses the cached matrix.
pub struct WarpEngine {
    background: Rgb<u8>,
    /// Last solve attempt; `None` transform means the quad was degenerate
    cached: Option<(CacheKey, Option<PerspectiveTransform>)>,
    last_valid: Option<PerspectiveTransform>,
    letterbox: Option<((u32, u32, u32, u32), PerspectiveTransform)>,
    solve_count: u64,
}

impl WarpEngine {
    pub fn new(background: Rgb<u8>) -> Self {
        Self {
            background,
            cached: None,
            last_valid: None,
            letterbox: None,
            solve_count: 0,
        }
    }

    /// Number of homography solves performed so far
    pub fn solve_count(&self) -> u64 {
        self.solve_count
    }

    /// True if the next `transform` call has to solve again
    pub fn is_dirty(&self, quad: &Quad, src_dims: (u32, u32)) -> bool {
        let key = CacheKey::new(quad, src_dims);
        !matches!(&self.cached, Some((cached, _)) if *cached == key)
    }

    /// Transform mapping the source rectangle onto `quad`, solved on demand
    pub fn transform(
        &mut self,
        quad: &Quad,
        src_dims: (u32, u32),
    ) -> Result<&PerspectiveTransform, WarpError> {
        if self.is_dirty(quad, src_dims) {
            let key = CacheKey::new(quad, src_dims);
            let corners = quad.corners().map(|p| p.as_tuple());
            let solved = PerspectiveTransform::from_rect(src_dims.0, src_dims.1, corners);
            self.solve_count += 1;

            match &solved {
                Some(t) => {
                    debug!("Solved homography for quad revision {}: {:?}", key.revision, t.matrix());
                    self.last_valid = Some(t.clone());
                }
                None => debug!("Quad revision {} is degenerate", key.revision),
            }
            self.cached = Some((key, solved));
        }

        match &self.cached {
            Some((_, Some(t))) => Ok(t),
            _ => Err(WarpError::DegenerateQuad),
        }
    }

    /// Most recent successfully solved transform, if any
    #[cfg(test)]
    pub fn last_valid(&self) -> Option<&PerspectiveTransform> {
        self.last_valid.as_ref()
    }

    /// Warp `frame` onto `quad` into a new frame of `surface` size
    pub fn render(
        &mut self,
        quad: &Quad,
        frame: &RgbImage,
        surface: (u32, u32),
    ) -> Result<OutputFrame, WarpError> {
        let background = self.background;
        let transform = self.transform(quad, frame.dimensions())?;
        Ok(warp_into_surface(transform, frame, surface, background))
    }

    /// Warp with the last valid transform, used while the quad is degenerate
    pub fn render_last_valid(&self, frame: &RgbImage, surface: (u32, u32)) -> Option<OutputFrame> {
        self.last_valid
            .as_ref()
            .map(|t| warp_into_surface(t, frame, surface, self.background))
    }

    /// Unwarped preview: the frame scaled to fit the surface, aspect ratio
    /// preserved and centered.
    pub fn letterbox(&mut self, frame: &RgbImage, surface: (u32, u32)) -> OutputFrame {
        let (src_w, src_h) = frame.dimensions();
        let key = (src_w, src_h, surface.0, surface.1);

        let stale = !matches!(&self.letterbox, Some((k, _)) if *k == key);
        if stale {
            let fit = fit_rect((src_w, src_h), surface);
            match PerspectiveTransform::from_rect(src_w, src_h, fit.corners().map(|p| p.as_tuple())) {
                Some(t) => self.letterbox = Some((key, t)),
                None => return self.background_frame(surface),
            }
        }

        match &self.letterbox {
            Some((_, t)) => warp_into_surface(t, frame, surface, self.background),
            None => self.background_frame(surface),
        }
    }

    /// A frame of background color, for when nothing valid can be drawn
    pub fn background_frame(&self, surface: (u32, u32)) -> OutputFrame {
        OutputFrame::filled(surface.0, surface.1, self.background)
    }
}

fn warp_into_surface(
    transform: &PerspectiveTransform,
    frame: &RgbImage,
    (width, height): (u32, u32),
    background: Rgb<u8>,
) -> OutputFrame {
    let mut out = RgbImage::from_pixel(width, height, background);
    transform.warp_rgb(frame, &mut out, background);
    OutputFrame::new(out)
}

/// Largest rectangle with the source aspect ratio centered in the surface
pub fn fit_rect((src_w, src_h): (u32, u32), (surf_w, surf_h): (u32, u32)) -> Rect {
    if src_w == 0 || src_h == 0 {
        return Rect::from_size(surf_w, surf_h);
    }
    let scale = (surf_w as f64 / src_w as f64).min(surf_h as f64 / src_h as f64);
    let width = src_w as f64 * scale;
    let height = src_h as f64 * scale;
    Rect::new(
        (surf_w as f64 - width) / 2.0,
        (surf_h as f64 - height) / 2.0,
        width,
        height,
    )
}
