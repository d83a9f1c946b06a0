//! Quad model: the four destination corners and their UI labels

use crate::config::{Point, Rect};

/// Corner labels in winding order
pub const CORNER_LABELS: [&str; 4] = ["Top Left", "Top Right", "Bottom Right", "Bottom Left"];

/// The four corners the source frame is mapped onto.
///
/// Order is fixed: top-left, top-right, bottom-right, bottom-left. The
/// revision counter changes on every mutation so derived transforms can tell
/// whether they are stale. Collinear or self-intersecting corners are accepted
/// here; whether a transform exists is decided by the warp engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Quad {
    corners: [Point; 4],
    revision: u64,
}

impl Quad {
    /// Quad covering the given rectangle
    pub fn from_rect(bounds: Rect) -> Self {
        Self::from_corners(bounds.corners())
    }

    pub fn from_corners(corners: [Point; 4]) -> Self {
        Self {
            corners,
            revision: 0,
        }
    }

    /// Current corners in winding order
    pub fn corners(&self) -> [Point; 4] {
        self.corners
    }

    /// Mutation stamp, bumped by every change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace one corner. Returns false (and leaves the quad untouched) for
    /// an index outside 0..=3.
    pub fn set_corner(&mut self, index: usize, point: Point) -> bool {
        match self.corners.get_mut(index) {
            Some(corner) => {
                *corner = point;
                self.revision += 1;
                true
            }
            None => {
                tracing::warn!("Invalid corner index: {}", index);
                false
            }
        }
    }

    /// Reset corners to the four corners of `bounds`
    pub fn reset(&mut self, bounds: Rect) {
        self.replace(bounds.corners());
    }

    /// Replace all four corners at once (preset load)
    pub fn replace(&mut self, corners: [Point; 4]) {
        self.corners = corners;
        self.revision += 1;
    }

    /// Corners paired with their labels, in winding order
    pub fn handles(&self) -> [(&'static str, Point); 4] {
        [0, 1, 2, 3].map(|i| (CORNER_LABELS[i], self.corners[i]))
    }

    /// Axis-aligned bounds of the four corners
    pub fn bounding_box(&self) -> Rect {
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in &self.corners {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }
}
