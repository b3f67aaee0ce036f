//! Wayland event handlers for the selector.
//!
//! Everything runs on the selector's single dispatch thread; handlers
//! mutate [`SelectorState`] directly.

use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_keyboard::{self, KeymapFormat, WlKeyboard};
use wayland_client::protocol::wl_pointer::{self, ButtonState, WlPointer};
use wayland_client::protocol::wl_seat::{self, Capability, WlSeat};
use wayland_client::protocol::wl_shm::WlShm;
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{delegate_noop, Connection, Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols::wp::keyboard_shortcuts_inhibit::zv1::client::{
    zwp_keyboard_shortcuts_inhibit_manager_v1::ZwpKeyboardShortcutsInhibitManagerV1,
    zwp_keyboard_shortcuts_inhibitor_v1::ZwpKeyboardShortcutsInhibitorV1,
};
use wayland_protocols::wp::viewporter::client::wp_viewport::WpViewport;
use wayland_protocols::wp::viewporter::client::wp_viewporter::WpViewporter;
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::ZwlrLayerShellV1,
    zwlr_layer_surface_v1::{self, ZwlrLayerSurfaceV1},
};
use wayland_protocols_wlr::screencopy::v1::client::{
    zwlr_screencopy_frame_v1::{self, Flags, ZwlrScreencopyFrameV1},
    zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
};
use xkbcommon::xkb;

use super::draw::CURSOR_HOTSPOT;
use super::types::{BufferKind, PreCaptureTarget, SelectionState};
use super::SelectorState;
use crate::buffer::{apply_transform, bytes_per_pixel, inverse_transform, ShmBuffer};

const BTN_LEFT: u32 = 0x110;

// =============================================================================
// Pre-capture frames
// =============================================================================

impl Dispatch<ZwlrScreencopyFrameV1, PreCaptureTarget> for SelectorState {
    fn event(
        state: &mut Self,
        proxy: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        target: &PreCaptureTarget,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let slot = usize::from(!target.with_cursor);

        match event {
            zwlr_screencopy_frame_v1::Event::Buffer {
                format,
                width,
                height,
                stride,
            } => {
                let WEnum::Value(format) = format else {
                    error!("compositor offered an unknown pixel format, failing pre-capture");
                    state.finish_pre_capture(proxy, target, slot, false);
                    return;
                };
                let Some(bpp) = bytes_per_pixel(format) else {
                    error!("unsupported pre-capture format {format:?}");
                    state.finish_pre_capture(proxy, target, slot, false);
                    return;
                };
                if (stride as usize) < width as usize * bpp {
                    error!("invalid stride {stride} from compositor (width {width})");
                    state.finish_pre_capture(proxy, target, slot, false);
                    return;
                }

                match ShmBuffer::create(width as i32, height as i32, stride as i32, format) {
                    Ok(buf) => {
                        state.pending[target.output][slot].buffer = Some(buf);
                        if proxy.version() < 3 {
                            state.start_pre_capture_copy(proxy, target, slot, qh);
                        }
                    }
                    Err(err) => {
                        error!("failed to create pre-capture buffer: {err}");
                        state.finish_pre_capture(proxy, target, slot, false);
                    }
                }
            }
            zwlr_screencopy_frame_v1::Event::BufferDone => {
                if state.pending[target.output][slot].buffer.is_some() {
                    state.start_pre_capture_copy(proxy, target, slot, qh);
                } else {
                    state.finish_pre_capture(proxy, target, slot, false);
                }
            }
            zwlr_screencopy_frame_v1::Event::Flags { flags } => {
                if let WEnum::Value(flags) = flags {
                    state.pending[target.output][slot].y_inverted =
                        flags.contains(Flags::YInvert);
                }
            }
            zwlr_screencopy_frame_v1::Event::Ready { .. } => {
                state.finish_pre_capture(proxy, target, slot, true);
            }
            zwlr_screencopy_frame_v1::Event::Failed => {
                error!("pre-capture failed for output {}", target.output);
                state.finish_pre_capture(proxy, target, slot, false);
            }
            _ => (),
        }
    }
}

impl SelectorState {
    fn start_pre_capture_copy(
        &mut self,
        frame: &ZwlrScreencopyFrameV1,
        target: &PreCaptureTarget,
        slot: usize,
        qh: &QueueHandle<Self>,
    ) {
        let pending = &mut self.pending[target.output][slot];
        let Some(buf) = &pending.buffer else {
            return;
        };

        let pool = self.shm.create_pool(buf.fd(), buf.size() as i32, qh, ());
        let wl_buffer = pool.create_buffer(
            0,
            buf.width(),
            buf.height(),
            buf.stride(),
            buf.format(),
            qh,
            BufferKind::PreCapture,
        );
        pool.destroy();

        frame.copy(&wl_buffer);
        pending.wl_buffer = Some(wl_buffer);
    }

    /// Tears down one pre-capture frame, post-processing its buffer on
    /// success, and bumps the completion counter either way.
    fn finish_pre_capture(
        &mut self,
        frame: &ZwlrScreencopyFrameV1,
        target: &PreCaptureTarget,
        slot: usize,
        success: bool,
    ) {
        frame.destroy();
        let pending = std::mem::take(&mut self.pending[target.output][slot]);
        if let Some(wl_buffer) = pending.wl_buffer {
            wl_buffer.destroy();
        }

        if success {
            if let Some(buf) = pending.buffer {
                match self.post_process(buf, pending.y_inverted, target.output) {
                    Ok(buf) => {
                        let pre = &mut self.pre[target.output];
                        pre.format = Some(buf.format());
                        if target.with_cursor {
                            pre.with_cursor = Some(buf);
                        } else {
                            pre.without_cursor = Some(buf);
                        }
                    }
                    Err(err) => error!("pre-capture post-processing failed: {err}"),
                }
            }
        }

        self.completions += 1;
    }

    /// Expansion, flip, and inverse transform, same order as the capture
    /// driver.
    fn post_process(
        &self,
        buf: ShmBuffer,
        y_inverted: bool,
        output: usize,
    ) -> Result<ShmBuffer, crate::buffer::BufferError> {
        let mut buf = buf.convert_to_32bit()?;
        if y_inverted {
            buf.flip_vertical();
        }
        let transform = self.outputs[output].transform;
        if transform != wayland_client::protocol::wl_output::Transform::Normal {
            buf = apply_transform(buf, inverse_transform(transform))?;
        }
        Ok(buf)
    }
}

// =============================================================================
// Layer surfaces
// =============================================================================

impl Dispatch<ZwlrLayerSurfaceV1, usize> for SelectorState {
    fn event(
        state: &mut Self,
        proxy: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        data: &usize,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                proxy.ack_configure(serial);
                let idx = *data;
                let first_configure = !state.surfaces[idx].configured;
                if width > 0 {
                    state.surfaces[idx].logical_w = width as i32;
                }
                if height > 0 {
                    state.surfaces[idx].logical_h = height as i32;
                }
                state.surfaces[idx].configured = true;

                if first_configure {
                    state.capture_for_surface(idx, qh);
                    state.ensure_inhibitor(idx, qh);
                } else {
                    state.redraw(idx);
                }
            }
            zwlr_layer_surface_v1::Event::Closed => {
                state.running = false;
                state.cancelled = true;
            }
            _ => (),
        }
    }
}

// =============================================================================
// Buffer release
// =============================================================================

impl Dispatch<WlBuffer, BufferKind> for SelectorState {
    fn event(
        state: &mut Self,
        _proxy: &WlBuffer,
        event: wl_buffer::Event,
        data: &BufferKind,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            if let BufferKind::Slot { surface, slot } = *data {
                if let Some(slot) = state
                    .surfaces
                    .get_mut(surface)
                    .and_then(|os| os.slots[slot].as_mut())
                {
                    slot.busy = false;
                }
            }
        }
    }
}

// =============================================================================
// Seat and input
// =============================================================================

impl Dispatch<WlSeat, ()> for SelectorState {
    fn event(
        state: &mut Self,
        proxy: &WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities {
            capabilities: WEnum::Value(capabilities),
        } = event
        {
            if capabilities.contains(Capability::Pointer) && state.pointer.is_none() {
                state.pointer = Some(proxy.get_pointer(qh, ()));
            }
            if capabilities.contains(Capability::Keyboard) && state.keyboard.is_none() {
                state.keyboard = Some(proxy.get_keyboard(qh, ()));
            }
        }
    }
}

impl Dispatch<WlPointer, ()> for SelectorState {
    fn event(
        state: &mut Self,
        proxy: &WlPointer,
        event: wl_pointer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_pointer::Event::Enter {
                serial,
                surface,
                surface_x,
                surface_y,
            } => {
                state.active_surface = state
                    .surfaces
                    .iter()
                    .position(|os| os.wl_surface.id() == surface.id());
                state.pointer_x = surface_x;
                state.pointer_y = surface_y;

                if let Some(cursor) = &state.cursor_surface {
                    proxy.set_cursor(serial, Some(cursor), CURSOR_HOTSPOT, CURSOR_HOTSPOT);
                }

                if let Some(idx) = state.active_surface {
                    state.redraw(idx);
                }
            }
            wl_pointer::Event::Leave { .. } => {
                if !state.selection.dragging {
                    state.active_surface = None;
                }
            }
            wl_pointer::Event::Motion {
                surface_x,
                surface_y,
                ..
            } => {
                state.pointer_x = surface_x;
                state.pointer_y = surface_y;

                if state.selection.dragging && state.selection.surface == state.active_surface {
                    state.selection.current_x = surface_x;
                    state.selection.current_y = surface_y;
                }

                if let Some(idx) = state.active_surface {
                    state.redraw(idx);
                }
            }
            wl_pointer::Event::Button {
                button,
                state: WEnum::Value(button_state),
                ..
            } if button == BTN_LEFT => match button_state {
                ButtonState::Pressed => {
                    if let Some(idx) = state.active_surface {
                        state.selection = SelectionState {
                            has_selection: true,
                            dragging: true,
                            surface: Some(idx),
                            anchor_x: state.pointer_x,
                            anchor_y: state.pointer_y,
                            current_x: state.pointer_x,
                            current_y: state.pointer_y,
                        };
                        state.redraw_all();
                    }
                }
                ButtonState::Released => {
                    if state.selection.dragging {
                        state.selection.dragging = false;
                        if state.selection.is_degenerate(state.shift_held) {
                            state.selection.clear();
                        }
                        state.redraw_all();
                    }
                }
                _ => (),
            },
            _ => (),
        }
    }
}

impl Dispatch<WlKeyboard, ()> for SelectorState {
    fn event(
        state: &mut Self,
        _proxy: &WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => {
                if format != WEnum::Value(KeymapFormat::XkbV1) {
                    warn!("unrecognized keymap format, keyboard input disabled");
                    return;
                }
                // Safety: the compositor hands us a private mmap-able fd of
                // exactly `size` bytes (NUL-terminated keymap text).
                let keymap = unsafe {
                    xkb::Keymap::new_from_fd(
                        &state.xkb_context,
                        fd,
                        (size - 1) as usize,
                        xkb::KEYMAP_FORMAT_TEXT_V1,
                        xkb::KEYMAP_COMPILE_NO_FLAGS,
                    )
                };
                match keymap {
                    Ok(Some(keymap)) => state.xkb_state = Some(xkb::State::new(&keymap)),
                    _ => warn!("failed to compile keymap"),
                }
            }
            wl_keyboard::Event::Modifiers {
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
                ..
            } => {
                let Some(xkb_state) = &mut state.xkb_state else {
                    return;
                };
                xkb_state.update_mask(mods_depressed, mods_latched, mods_locked, 0, 0, group);
                let shift =
                    xkb_state.mod_name_is_active(xkb::MOD_NAME_SHIFT, xkb::STATE_MODS_EFFECTIVE);
                if shift != state.shift_held {
                    state.shift_held = shift;
                    if state.selection.dragging {
                        if let Some(idx) = state.active_surface {
                            state.redraw(idx);
                        }
                    }
                }
            }
            wl_keyboard::Event::Key {
                key,
                state: WEnum::Value(wl_keyboard::KeyState::Pressed),
                ..
            } => {
                let Some(xkb_state) = &state.xkb_state else {
                    return;
                };
                let sym = xkb_state.key_get_one_sym(xkb::Keycode::new(key + 8));
                state.handle_key(sym);
            }
            _ => (),
        }
    }
}

impl SelectorState {
    fn handle_key(&mut self, sym: xkb::Keysym) {
        if sym == xkb::Keysym::Escape {
            if self.selection.has_selection {
                self.selection.clear();
                self.redraw_all();
            } else {
                self.running = false;
                self.cancelled = true;
            }
        } else if sym == xkb::Keysym::Return || sym == xkb::Keysym::KP_Enter {
            self.confirm();
        } else if sym == xkb::Keysym::c || sym == xkb::Keysym::C {
            self.show_captured_cursor = !self.show_captured_cursor;
            self.redraw_all();
        }
    }
}

// =============================================================================
// Event-less / ignored protocols
// =============================================================================

delegate_noop!(SelectorState: WlCompositor);
delegate_noop!(SelectorState: ignore WlShm);
delegate_noop!(SelectorState: WlShmPool);
delegate_noop!(SelectorState: ignore WlSurface);
delegate_noop!(SelectorState: ZwlrLayerShellV1);
delegate_noop!(SelectorState: ZwlrScreencopyManagerV1);
delegate_noop!(SelectorState: WpViewporter);
delegate_noop!(SelectorState: WpViewport);
delegate_noop!(SelectorState: ZwpKeyboardShortcutsInhibitManagerV1);
delegate_noop!(SelectorState: ignore ZwpKeyboardShortcutsInhibitorV1);
