//! Interactive region selection.
//!
//! One layer-shell overlay per output on the overlay layer, fed from
//! pre-captured screen contents so the image under the selector is frozen.
//! Every output is captured twice up front (with and without the cursor);
//! the overlays only become interactive once all `2 * N` pre-captures have
//! completed. Rendering is triple-buffered per surface.

use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_keyboard::WlKeyboard;
use wayland_client::protocol::wl_pointer::WlPointer;
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::protocol::wl_shm::{self, WlShm};
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{Proxy, QueueHandle};
use wayland_protocols::wp::keyboard_shortcuts_inhibit::zv1::client::{
    zwp_keyboard_shortcuts_inhibit_manager_v1::ZwpKeyboardShortcutsInhibitManagerV1,
    zwp_keyboard_shortcuts_inhibitor_v1::ZwpKeyboardShortcutsInhibitorV1,
};
use wayland_protocols::wp::viewporter::client::wp_viewporter::WpViewporter;
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::{Layer, ZwlrLayerShellV1},
    zwlr_layer_surface_v1::{Anchor, KeyboardInteractivity},
};
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1;
use xkbcommon::xkb;

use crate::buffer::ShmBuffer;
use crate::capture::{CaptureError, CaptureResult};
use crate::region::{load_last_region, Region};
use crate::wayland::{Session, WaylandError, WaylandOutput};

mod dispatch;
mod draw;
mod types;

use types::{BufferKind, OutputSurface, PreCapture, PreCaptureTarget, PendingFrame, SelectionState};

const NAMESPACE: &str = "dusk-selector";

/// Runs the selector. `Ok(None)` means the user cancelled.
pub fn select_region(
    session: &Session,
    include_cursor: bool,
) -> Result<Option<CaptureResult>, CaptureError> {
    let outputs: Vec<WaylandOutput> = session.outputs().to_vec();
    if outputs.is_empty() {
        return Err(WaylandError::NoOutputs.into());
    }

    let mut queue = session.conn.new_event_queue::<SelectorState>();
    let qh = queue.handle();

    let compositor: WlCompositor = session
        .globals
        .bind(&qh, 1..=6, ())
        .map_err(|_| WaylandError::UnsupportedProtocol("wl_compositor"))?;
    let shm: WlShm = session
        .globals
        .bind(&qh, 1..=1, ())
        .map_err(|_| WaylandError::UnsupportedProtocol("wl_shm"))?;
    let seat: WlSeat = session
        .globals
        .bind(&qh, 1..=9, ())
        .map_err(|_| WaylandError::UnsupportedProtocol("wl_seat"))?;
    let layer_shell: ZwlrLayerShellV1 = session
        .globals
        .bind(&qh, 1..=4, ())
        .map_err(|_| WaylandError::UnsupportedProtocol("wlr-layer-shell-unstable-v1"))?;
    let screencopy: ZwlrScreencopyManagerV1 = session
        .globals
        .bind(&qh, 1..=3, ())
        .map_err(|_| WaylandError::UnsupportedProtocol("wlr-screencopy-unstable-v1"))?;
    let viewporter: Option<WpViewporter> = session.globals.bind(&qh, 1..=1, ()).ok();
    let inhibit_manager: Option<ZwpKeyboardShortcutsInhibitManagerV1> =
        session.globals.bind(&qh, 1..=1, ()).ok();

    let output_count = outputs.len();
    let mut state = SelectorState {
        shm,
        seat,
        screencopy,
        inhibit_manager,
        inhibitor: None,
        pointer: None,
        keyboard: None,
        xkb_context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
        xkb_state: None,
        outputs,
        pending: (0..output_count).map(|_| Default::default()).collect(),
        pre: (0..output_count).map(|_| PreCapture::default()).collect(),
        completions: 0,
        surfaces: Vec::new(),
        active_surface: None,
        cursor_surface: None,
        cursor_wl_buffer: None,
        cursor_shm: None,
        selection: SelectionState::default(),
        pointer_x: 0.0,
        pointer_y: 0.0,
        pre_select: load_last_region(),
        show_captured_cursor: include_cursor,
        shift_held: false,
        running: false,
        cancelled: false,
        result: None,
    };

    // Kick off every pre-capture at once; they complete in any order.
    for i in 0..output_count {
        let wl_output = state.outputs[i].wl_output.clone();
        state.screencopy.capture_output(
            1,
            &wl_output,
            &qh,
            PreCaptureTarget {
                output: i,
                with_cursor: true,
            },
        );
        state.screencopy.capture_output(
            0,
            &wl_output,
            &qh,
            PreCaptureTarget {
                output: i,
                with_cursor: false,
            },
        );
    }

    let total = output_count * 2;
    while state.completions < total {
        queue
            .blocking_dispatch(&mut state)
            .map_err(WaylandError::from)?;
    }

    state.create_surfaces(&compositor, &layer_shell, viewporter.as_ref(), &qh);
    if let Err(err) = state.create_cursor(&compositor, &qh) {
        debug!("failed to create selector cursor: {err}");
    }

    state.running = true;
    while state.running {
        queue
            .blocking_dispatch(&mut state)
            .map_err(WaylandError::from)?;
    }

    state.cleanup();

    if state.cancelled {
        return Ok(None);
    }
    Ok(state.result.take())
}

/// All selector state, owned by the dispatch loop.
pub(crate) struct SelectorState {
    pub(crate) shm: WlShm,
    pub(crate) seat: WlSeat,
    pub(crate) screencopy: ZwlrScreencopyManagerV1,
    pub(crate) inhibit_manager: Option<ZwpKeyboardShortcutsInhibitManagerV1>,
    pub(crate) inhibitor: Option<ZwpKeyboardShortcutsInhibitorV1>,

    pub(crate) pointer: Option<WlPointer>,
    pub(crate) keyboard: Option<WlKeyboard>,
    pub(crate) xkb_context: xkb::Context,
    pub(crate) xkb_state: Option<xkb::State>,

    pub(crate) outputs: Vec<WaylandOutput>,
    /// In-flight pre-capture frames: `[with_cursor, without_cursor]`.
    pub(crate) pending: Vec<[PendingFrame; 2]>,
    pub(crate) pre: Vec<PreCapture>,
    pub(crate) completions: usize,

    pub(crate) surfaces: Vec<OutputSurface>,
    pub(crate) active_surface: Option<usize>,

    pub(crate) cursor_surface: Option<WlSurface>,
    pub(crate) cursor_wl_buffer: Option<WlBuffer>,
    pub(crate) cursor_shm: Option<ShmBuffer>,

    pub(crate) selection: SelectionState,
    pub(crate) pointer_x: f64,
    pub(crate) pointer_y: f64,
    pub(crate) pre_select: Region,
    pub(crate) show_captured_cursor: bool,
    pub(crate) shift_held: bool,

    pub(crate) running: bool,
    pub(crate) cancelled: bool,
    pub(crate) result: Option<CaptureResult>,
}

impl SelectorState {
    fn create_surfaces(
        &mut self,
        compositor: &WlCompositor,
        layer_shell: &ZwlrLayerShellV1,
        viewporter: Option<&WpViewporter>,
        qh: &QueueHandle<Self>,
    ) {
        for (i, output) in self.outputs.clone().into_iter().enumerate() {
            let surface = compositor.create_surface(qh, ());
            let layer_surface = layer_shell.get_layer_surface(
                &surface,
                Some(&output.wl_output),
                Layer::Overlay,
                NAMESPACE.to_owned(),
                qh,
                i,
            );

            layer_surface
                .set_anchor(Anchor::Top | Anchor::Bottom | Anchor::Left | Anchor::Right);
            layer_surface.set_exclusive_zone(-1);
            layer_surface.set_keyboard_interactivity(KeyboardInteractivity::Exclusive);

            let viewport = viewporter.map(|v| v.get_viewport(&surface, qh, ()));

            surface.commit();

            self.surfaces.push(OutputSurface {
                output,
                wl_surface: surface,
                layer_surface,
                viewport,
                screen_buf: None,
                screen_buf_no_cursor: None,
                screen_format: wl_shm::Format::Xrgb8888,
                logical_w: 0,
                logical_h: 0,
                configured: false,
                slots: Default::default(),
                slots_ready: false,
            });
        }
    }

    fn create_cursor(
        &mut self,
        compositor: &WlCompositor,
        qh: &QueueHandle<Self>,
    ) -> Result<(), CaptureError> {
        let size = draw::CURSOR_SIZE;
        let mut buf = ShmBuffer::create(size, size, size * 4, wl_shm::Format::Argb8888)?;
        draw::draw_cursor_bitmap(&mut buf);

        let surface = compositor.create_surface(qh, ());
        let pool = self.shm.create_pool(buf.fd(), buf.size() as i32, qh, ());
        let wl_buffer = pool.create_buffer(
            0,
            size,
            size,
            size * 4,
            wl_shm::Format::Argb8888,
            qh,
            BufferKind::Cursor,
        );
        pool.destroy();

        surface.attach(Some(&wl_buffer), 0, 0);
        surface.damage(0, 0, size, size);
        surface.commit();

        self.cursor_surface = Some(surface);
        self.cursor_wl_buffer = Some(wl_buffer);
        self.cursor_shm = Some(buf);
        Ok(())
    }

    /// Wires a configured surface to its pre-captures and render slots.
    pub(crate) fn capture_for_surface(&mut self, idx: usize, qh: &QueueHandle<Self>) {
        let pre = std::mem::take(&mut self.pre[idx]);
        let os = &mut self.surfaces[idx];

        os.screen_buf = pre.with_cursor;
        os.screen_buf_no_cursor = pre.without_cursor;
        if let Some(format) = pre.format {
            os.screen_format = format;
        }

        if os.logical_w > 0 {
            if let Some(buf) = &os.screen_buf {
                os.output.fractional_scale =
                    f64::from(buf.width()) / f64::from(os.logical_w);
            }
        }

        self.init_render_slots(idx, qh);
        self.apply_pre_selection(idx);
        self.redraw(idx);
    }

    fn init_render_slots(&mut self, idx: usize, qh: &QueueHandle<Self>) {
        let os = &mut self.surfaces[idx];
        let Some(screen) = &os.screen_buf else {
            return;
        };
        let (w, h, stride) = (screen.width(), screen.height(), screen.stride());
        let format = os.screen_format;

        for slot_i in 0..os.slots.len() {
            let shm_buf = match ShmBuffer::create(w, h, stride, format) {
                Ok(buf) => buf,
                Err(err) => {
                    error!("failed to create render slot buffer: {err}");
                    return;
                }
            };

            let pool = self
                .shm
                .create_pool(shm_buf.fd(), shm_buf.size() as i32, qh, ());
            let wl_buffer = pool.create_buffer(
                0,
                w,
                h,
                stride,
                format,
                qh,
                BufferKind::Slot {
                    surface: idx,
                    slot: slot_i,
                },
            );
            pool.destroy();

            os.slots[slot_i] = Some(types::RenderSlot {
                shm: shm_buf,
                wl_buffer,
                busy: false,
            });
        }
        os.slots_ready = true;
    }

    /// Restores the persisted last region as an immediate selection on the
    /// matching output, so Enter repeats the previous capture.
    fn apply_pre_selection(&mut self, idx: usize) {
        if self.pre_select.is_empty() || self.selection.has_selection {
            return;
        }
        let os = &self.surfaces[idx];
        if os.screen_buf.is_none() {
            return;
        }
        if let Some(wanted) = self.pre_select.output.as_deref() {
            if wanted != os.output.name {
                return;
            }
        }

        let x1 = f64::from(self.pre_select.x - os.output.x);
        let y1 = f64::from(self.pre_select.y - os.output.y);

        self.selection = SelectionState {
            has_selection: true,
            dragging: false,
            surface: Some(idx),
            anchor_x: x1,
            anchor_y: y1,
            current_x: x1 + f64::from(self.pre_select.width),
            current_y: y1 + f64::from(self.pre_select.height),
        };
        self.active_surface = Some(idx);
    }

    pub(crate) fn ensure_inhibitor(&mut self, idx: usize, qh: &QueueHandle<Self>) {
        if self.inhibitor.is_some() {
            return;
        }
        let Some(manager) = &self.inhibit_manager else {
            return;
        };
        let surface = &self.surfaces[idx].wl_surface;
        self.inhibitor = Some(manager.inhibit_shortcuts(surface, &self.seat, qh, ()));
    }

    /// Repaints one surface into a free render slot. Dropped when all three
    /// slots are still held by the compositor.
    pub(crate) fn redraw(&mut self, idx: usize) {
        let selection_rect = if self.selection.has_selection && self.selection.surface == Some(idx)
        {
            let (sx, sy) = self.surfaces[idx].buffer_scale();
            let (lx, ly, lw, lh) = self.selection.rect(self.shift_held);
            Some((
                (lx * sx).round() as i32,
                (ly * sy).round() as i32,
                (lw * sx).round() as i32,
                (lh * sy).round() as i32,
            ))
        } else {
            None
        };

        let crosshair = if self.active_surface == Some(idx) && !self.selection.has_selection {
            let (sx, sy) = self.surfaces[idx].buffer_scale();
            Some((
                (self.pointer_x * sx).round() as i32,
                (self.pointer_y * sy).round() as i32,
            ))
        } else {
            None
        };

        let show_cursor = self.show_captured_cursor;
        let os = &mut self.surfaces[idx];
        if !os.slots_ready {
            return;
        }
        let Some(slot_i) = os.free_slot() else {
            return;
        };

        let source = if !show_cursor && os.screen_buf_no_cursor.is_some() {
            os.screen_buf_no_cursor.as_ref()
        } else {
            os.screen_buf.as_ref()
        };
        let Some(source) = source else {
            return;
        };

        let Some(slot) = os.slots[slot_i].as_mut() else {
            return;
        };
        slot.shm.copy_from(source);
        draw::draw_overlay(&mut slot.shm, selection_rect);
        if let Some((cx, cy)) = crosshair {
            draw::draw_crosshair(&mut slot.shm, cx, cy);
        }

        if let Some(viewport) = &os.viewport {
            os.wl_surface.set_buffer_scale(1);
            viewport.set_source(
                0.0,
                0.0,
                f64::from(slot.shm.width()),
                f64::from(slot.shm.height()),
            );
            viewport.set_destination(os.logical_w.max(1), os.logical_h.max(1));
        } else {
            os.wl_surface.set_buffer_scale(os.output.scale.max(1));
        }

        os.wl_surface.attach(Some(&slot.wl_buffer), 0, 0);
        os.wl_surface.damage(0, 0, os.logical_w.max(1), os.logical_h.max(1));
        os.wl_surface.commit();
        slot.busy = true;
    }

    pub(crate) fn redraw_all(&mut self) {
        for idx in 0..self.surfaces.len() {
            self.redraw(idx);
        }
    }

    /// Finalizes the current selection into a capture result.
    pub(crate) fn confirm(&mut self) {
        if !self.selection.has_selection || self.selection.is_degenerate(self.shift_held) {
            return;
        }
        let Some(idx) = self.selection.surface else {
            return;
        };

        let (lx, ly, lw, lh) = self.selection.rect(self.shift_held);
        let os = &self.surfaces[idx];
        let (sx, sy) = os.buffer_scale();

        let source = if !self.show_captured_cursor && os.screen_buf_no_cursor.is_some() {
            os.screen_buf_no_cursor.as_ref()
        } else {
            os.screen_buf.as_ref()
        };
        let Some(source) = source else {
            warn!("no captured source for selection surface");
            return;
        };

        let bx = (lx * sx).round() as i32;
        let by = (ly * sy).round() as i32;
        let bw = ((lw * sx).round() as i32).max(1);
        let bh = ((lh * sy).round() as i32).max(1);

        let Some(cropped) = source.crop(bx, by, bw, bh) else {
            warn!("selection does not intersect the captured buffer");
            return;
        };

        let region = Region {
            x: os.output.x + lx.round() as i32,
            y: os.output.y + ly.round() as i32,
            width: lw.round() as i32,
            height: lh.round() as i32,
            output: Some(os.output.name.clone()),
        };

        self.result = Some(CaptureResult {
            buffer: cropped,
            region,
            y_inverted: false,
            format: os.screen_format,
        });
        self.running = false;
    }

    fn cleanup(&mut self) {
        if let Some(buf) = self.cursor_wl_buffer.take() {
            buf.destroy();
        }
        if let Some(surface) = self.cursor_surface.take() {
            surface.destroy();
        }

        for os in &mut self.surfaces {
            for slot in os.slots.iter_mut().flatten() {
                slot.wl_buffer.destroy();
            }
            if let Some(viewport) = os.viewport.take() {
                viewport.destroy();
            }
            os.layer_surface.destroy();
            os.wl_surface.destroy();
        }

        if let Some(inhibitor) = self.inhibitor.take() {
            inhibitor.destroy();
        }
        if let Some(pointer) = self.pointer.take() {
            if pointer.version() >= 3 {
                pointer.release();
            }
        }
        if let Some(keyboard) = self.keyboard.take() {
            if keyboard.version() >= 3 {
                keyboard.release();
            }
        }
        self.screencopy.destroy();
    }
}
