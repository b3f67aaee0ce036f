//! Data types for the region selector.

use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_shm;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_protocols::wp::viewporter::client::wp_viewport::WpViewport;
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1::ZwlrLayerSurfaceV1;

use crate::buffer::ShmBuffer;
use crate::wayland::WaylandOutput;

/// User data attached to every wl_buffer the selector creates.
#[derive(Debug, Clone, Copy)]
pub enum BufferKind {
    /// Buffer receiving a pre-capture copy; never attached to a surface.
    PreCapture,
    /// One of a surface's three render slots.
    Slot { surface: usize, slot: usize },
    /// The crosshair cursor image.
    Cursor,
}

/// User data attached to a pre-capture screencopy frame.
#[derive(Debug, Clone, Copy)]
pub struct PreCaptureTarget {
    pub output: usize,
    pub with_cursor: bool,
}

/// In-flight state of one pre-capture frame.
#[derive(Default)]
pub struct PendingFrame {
    pub buffer: Option<ShmBuffer>,
    pub wl_buffer: Option<WlBuffer>,
    pub y_inverted: bool,
}

/// The two finished pre-captures of one output.
#[derive(Default)]
pub struct PreCapture {
    pub with_cursor: Option<ShmBuffer>,
    pub without_cursor: Option<ShmBuffer>,
    pub format: Option<wl_shm::Format>,
}

/// One of the three buffers a surface rotates through.
///
/// `busy` is set on attach and cleared by the compositor's release event;
/// a busy slot is never attached again.
pub struct RenderSlot {
    pub shm: ShmBuffer,
    pub wl_buffer: WlBuffer,
    pub busy: bool,
}

/// The overlay on one output.
pub struct OutputSurface {
    pub output: WaylandOutput,
    pub wl_surface: WlSurface,
    pub layer_surface: ZwlrLayerSurfaceV1,
    pub viewport: Option<WpViewport>,

    /// Pre-captured screen contents, already upright.
    pub screen_buf: Option<ShmBuffer>,
    pub screen_buf_no_cursor: Option<ShmBuffer>,
    pub screen_format: wl_shm::Format,

    pub logical_w: i32,
    pub logical_h: i32,
    pub configured: bool,

    pub slots: [Option<RenderSlot>; 3],
    pub slots_ready: bool,
}

impl OutputSurface {
    /// Picks a slot that the compositor is not holding, if any.
    pub fn free_slot(&mut self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| !s.busy))
    }

    /// Scale from surface-local logical coordinates to buffer pixels.
    pub fn buffer_scale(&self) -> (f64, f64) {
        let Some(buf) = &self.screen_buf else {
            return (1.0, 1.0);
        };
        let sx = if self.logical_w > 0 {
            f64::from(buf.width()) / f64::from(self.logical_w)
        } else {
            1.0
        };
        let sy = if self.logical_h > 0 {
            f64::from(buf.height()) / f64::from(self.logical_h)
        } else {
            1.0
        };
        (sx, sy)
    }

}

/// The selection state machine.
///
/// Idle (no selection) -> Dragging (pointer down) -> Selected (pointer up)
/// -> Idle (Escape). Coordinates are surface-local logical on the anchor
/// surface.
#[derive(Debug, Default)]
pub struct SelectionState {
    pub has_selection: bool,
    pub dragging: bool,
    /// Index of the surface the selection was made on.
    pub surface: Option<usize>,
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub current_x: f64,
    pub current_y: f64,
}

impl SelectionState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Normalized selection rectangle `(x, y, w, h)` in surface-local
    /// logical coordinates. With `constrain_square`, the live drag keeps
    /// equal extents along both axes.
    pub fn rect(&self, constrain_square: bool) -> (f64, f64, f64, f64) {
        let mut dx = self.current_x - self.anchor_x;
        let mut dy = self.current_y - self.anchor_y;

        if constrain_square {
            let side = dx.abs().min(dy.abs());
            dx = side.copysign(dx);
            dy = side.copysign(dy);
        }

        let x = if dx < 0.0 { self.anchor_x + dx } else { self.anchor_x };
        let y = if dy < 0.0 { self.anchor_y + dy } else { self.anchor_y };
        (x, y, dx.abs(), dy.abs())
    }

    /// Whether the rectangle is too small to be a real selection.
    pub fn is_degenerate(&self, constrain_square: bool) -> bool {
        let (_, _, w, h) = self.rect(constrain_square);
        w < 1.0 || h < 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drag(anchor: (f64, f64), current: (f64, f64)) -> SelectionState {
        SelectionState {
            has_selection: true,
            dragging: true,
            surface: Some(0),
            anchor_x: anchor.0,
            anchor_y: anchor.1,
            current_x: current.0,
            current_y: current.1,
        }
    }

    #[test]
    fn rect_normalizes_direction() {
        let sel = drag((100.0, 100.0), (300.0, 400.0));
        assert_eq!(sel.rect(false), (100.0, 100.0, 200.0, 300.0));

        let sel = drag((300.0, 400.0), (100.0, 100.0));
        assert_eq!(sel.rect(false), (100.0, 100.0, 200.0, 300.0));
    }

    #[test]
    fn shift_constrains_to_square() {
        let sel = drag((10.0, 10.0), (110.0, 60.0));
        assert_eq!(sel.rect(true), (10.0, 10.0, 50.0, 50.0));

        // Dragging up-left keeps the square anchored at the pointer side.
        let sel = drag((100.0, 100.0), (40.0, 20.0));
        let (x, y, w, h) = sel.rect(true);
        assert_eq!((w, h), (60.0, 60.0));
        assert_eq!((x, y), (40.0, 40.0));
    }

    #[test]
    fn degenerate_selections_are_detected() {
        assert!(drag((5.0, 5.0), (5.4, 200.0)).is_degenerate(false));
        assert!(!drag((5.0, 5.0), (7.0, 7.0)).is_degenerate(false));
        // A thin drag becomes degenerate under the square constraint.
        assert!(drag((5.0, 5.0), (200.0, 5.5)).is_degenerate(true));
    }
}
