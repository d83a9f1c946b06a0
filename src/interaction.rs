//! Pointer interaction: corner handle hit-testing and dragging

use tracing::debug;

use crate::config::{Point, Rect};
use crate::quad::Quad;

/// Drag state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragState {
    Idle,
    Dragging(usize),
}

/// Pointer events relevant to handle editing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down(Point),
    Move(Point),
    Up(Point),
    /// Window lost focus or input capture
    FocusLost,
}

/// Maps pointer events onto corner edits of a [`Quad`]
#[derive(Debug, Clone)]
pub struct InteractionController {
    hit_radius: f64,
    state: DragState,
}

impl InteractionController {
    pub fn new(hit_radius: f64) -> Self {
        Self {
            hit_radius,
            state: DragState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DragState {
        self.state
    }

    /// Corner currently being dragged
    pub fn active_corner(&self) -> Option<usize> {
        match self.state {
            DragState::Dragging(i) => Some(i),
            DragState::Idle => None,
        }
    }

    /// Feed one pointer event.
    ///
    /// `clamp_to` is the editor surface; moves are clamped into it. Pass
    /// `None` in fullscreen projection, where no clamp applies.
    pub fn handle(&mut self, event: PointerEvent, quad: &mut Quad, clamp_to: Option<Rect>) {
        match (self.state, event) {
            (DragState::Idle, PointerEvent::Down(pos)) => {
                if let Some(index) = self.hit_test(quad, pos) {
                    let (label, corner) = quad.handles()[index];
                    debug!("Grabbed {} handle at ({:.1}, {:.1})", label, corner.x, corner.y);
                    self.state = DragState::Dragging(index);
                }
            }
            (DragState::Dragging(index), PointerEvent::Move(pos)) => {
                let pos = match clamp_to {
                    Some(bounds) => bounds.clamp(pos),
                    None => pos,
                };
                quad.set_corner(index, pos);
            }
            (DragState::Dragging(index), PointerEvent::Up(_)) => {
                let (label, corner) = quad.handles()[index];
                debug!("Released {} handle at ({:.1}, {:.1})", label, corner.x, corner.y);
                self.state = DragState::Idle;
            }
            (DragState::Dragging(_), PointerEvent::FocusLost) => {
                // The last applied position stands
                self.state = DragState::Idle;
            }
            _ => {}
        }
    }

    /// Nearest corner within the hit radius; exact ties go to the lowest index
    pub fn hit_test(&self, quad: &Quad, pos: Point) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, corner) in quad.corners().iter().enumerate() {
            let d = corner.distance(pos);
            if d > self.hit_radius {
                continue;
            }
            match best {
                Some((_, best_d)) if d >= best_d => {}
                _ => best = Some((index, d)),
            }
        }
        best.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Quad {
        Quad::from_rect(Rect::from_size(100, 100))
    }

    #[test]
    fn test_grab_drag_release_top_right() {
        let mut quad = square();
        let mut ctl = InteractionController::new(12.0);

        ctl.handle(PointerEvent::Down(Point::new(98.0, 2.0)), &mut quad, None);
        assert_eq!(ctl.state(), DragState::Dragging(1));

        ctl.handle(PointerEvent::Move(Point::new(150.0, -10.0)), &mut quad, None);
        ctl.handle(PointerEvent::Up(Point::new(150.0, -10.0)), &mut quad, None);

        assert_eq!(ctl.state(), DragState::Idle);
        assert_eq!(quad.corners()[1], Point::new(150.0, -10.0));
    }

    #[test]
    fn test_editor_drag_is_clamped() {
        let mut quad = square();
        let mut ctl = InteractionController::new(12.0);
        let editor = Rect::from_size(120, 120);

        ctl.handle(PointerEvent::Down(Point::new(98.0, 2.0)), &mut quad, Some(editor));
        ctl.handle(PointerEvent::Move(Point::new(150.0, -10.0)), &mut quad, Some(editor));

        assert_eq!(quad.corners()[1], Point::new(120.0, 0.0));
    }

    #[test]
    fn test_miss_stays_idle() {
        let mut quad = square();
        let before = quad.clone();
        let mut ctl = InteractionController::new(12.0);

        ctl.handle(PointerEvent::Down(Point::new(50.0, 50.0)), &mut quad, None);
        ctl.handle(PointerEvent::Move(Point::new(60.0, 60.0)), &mut quad, None);

        assert_eq!(ctl.state(), DragState::Idle);
        assert_eq!(quad, before);
    }

    #[test]
    fn test_overlap_prefers_nearest() {
        let quad = Quad::from_corners([
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ]);
        let ctl = InteractionController::new(12.0);
        assert_eq!(ctl.hit_test(&quad, Point::new(7.0, 1.0)), Some(1));
        assert_eq!(ctl.hit_test(&quad, Point::new(2.0, 9.0)), Some(3));
    }

    #[test]
    fn test_exact_tie_prefers_lowest_index() {
        let quad = Quad::from_corners([
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ]);
        let ctl = InteractionController::new(12.0);
        // Equidistant from corners 0 and 1
        assert_eq!(ctl.hit_test(&quad, Point::new(5.0, 0.0)), Some(0));
        // Equidistant from all four
        assert_eq!(ctl.hit_test(&quad, Point::new(5.0, 5.0)), Some(0));
    }

    #[test]
    fn test_focus_loss_keeps_last_position() {
        let mut quad = square();
        let mut ctl = InteractionController::new(12.0);

        ctl.handle(PointerEvent::Down(Point::new(0.0, 0.0)), &mut quad, None);
        ctl.handle(PointerEvent::Move(Point::new(20.0, 30.0)), &mut quad, None);
        ctl.handle(PointerEvent::FocusLost, &mut quad, None);

        assert_eq!(ctl.state(), DragState::Idle);
        assert_eq!(quad.corners()[0], Point::new(20.0, 30.0));

        // Further moves no longer edit the quad
        ctl.handle(PointerEvent::Move(Point::new(90.0, 90.0)), &mut quad, None);
        assert_eq!(quad.corners()[0], Point::new(20.0, 30.0));
    }

    #[test]
    fn test_release_anywhere_ends_drag() {
        let mut quad = square();
        let mut ctl = InteractionController::new(12.0);

        ctl.handle(PointerEvent::Down(Point::new(100.0, 100.0)), &mut quad, None);
        assert_eq!(ctl.active_corner(), Some(2));
        ctl.handle(PointerEvent::Up(Point::new(-500.0, 900.0)), &mut quad, None);
        assert_eq!(ctl.active_corner(), None);
    }
}
