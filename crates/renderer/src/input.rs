//! Pointer input forwarded from the window thread to the caller.

use winit::event::{ElementState, MouseButton, MouseScrollDelta};

/// Wheel pixels that count as one line on touchpads.
const PIXELS_PER_LINE: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// Cursor movement with the left button held, in physical pixels.
    Drag { dx: f32, dy: f32 },
    /// Wheel movement in lines; positive when scrolling up.
    Scroll { lines: f32 },
    Resized { width: u32, height: u32 },
}

/// Turns raw pointer events into [`InputEvent`]s.
#[derive(Debug, Default)]
pub(crate) struct PointerTracker {
    dragging: bool,
    last: Option<(f64, f64)>,
}

impl PointerTracker {
    pub(crate) fn button(&mut self, button: MouseButton, state: ElementState) {
        if button == MouseButton::Left {
            self.dragging = state == ElementState::Pressed;
        }
    }

    pub(crate) fn moved(&mut self, x: f64, y: f64) -> Option<InputEvent> {
        let previous = self.last.replace((x, y));
        if !self.dragging {
            return None;
        }
        let (px, py) = previous?;
        let (dx, dy) = ((x - px) as f32, (y - py) as f32);
        (dx != 0.0 || dy != 0.0).then_some(InputEvent::Drag { dx, dy })
    }

    /// The next movement starts a fresh drag instead of jumping.
    pub(crate) fn left(&mut self) {
        self.last = None;
    }

    pub(crate) fn wheel(&mut self, delta: MouseScrollDelta) -> Option<InputEvent> {
        let lines = match delta {
            MouseScrollDelta::LineDelta(_, y) => y,
            MouseScrollDelta::PixelDelta(position) => (position.y / PIXELS_PER_LINE) as f32,
        };
        (lines != 0.0).then_some(InputEvent::Scroll { lines })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::PhysicalPosition;

    #[test]
    fn movement_only_drags_while_left_button_held() {
        let mut tracker = PointerTracker::default();
        assert_eq!(tracker.moved(10.0, 10.0), None);
        tracker.button(MouseButton::Right, ElementState::Pressed);
        assert_eq!(tracker.moved(12.0, 10.0), None);

        tracker.button(MouseButton::Left, ElementState::Pressed);
        assert_eq!(
            tracker.moved(15.0, 6.0),
            Some(InputEvent::Drag { dx: 3.0, dy: -4.0 })
        );
        assert_eq!(tracker.moved(15.0, 6.0), None);

        tracker.button(MouseButton::Left, ElementState::Released);
        assert_eq!(tracker.moved(30.0, 30.0), None);
    }

    #[test]
    fn re_entering_the_window_does_not_jump() {
        let mut tracker = PointerTracker::default();
        tracker.button(MouseButton::Left, ElementState::Pressed);
        tracker.moved(0.0, 0.0);
        tracker.left();
        assert_eq!(tracker.moved(500.0, 500.0), None);
        assert_eq!(
            tracker.moved(501.0, 500.0),
            Some(InputEvent::Drag { dx: 1.0, dy: 0.0 })
        );
    }

    #[test]
    fn wheel_reports_lines_for_both_delta_kinds() {
        let mut tracker = PointerTracker::default();
        assert_eq!(
            tracker.wheel(MouseScrollDelta::LineDelta(0.0, -2.0)),
            Some(InputEvent::Scroll { lines: -2.0 })
        );
        assert_eq!(
            tracker.wheel(MouseScrollDelta::PixelDelta(PhysicalPosition::new(0.0, 80.0))),
            Some(InputEvent::Scroll { lines: 2.0 })
        );
        assert_eq!(tracker.wheel(MouseScrollDelta::LineDelta(3.0, 0.0)), None);
    }
}
