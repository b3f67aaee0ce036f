//! The wlr-screencopy frame state machine.
//!
//! One capture is one `zwlr_screencopy_frame_v1` on its own event queue.
//! The protocol guarantees `buffer → buffer_done → copy → flags → ready`
//! within a frame; this module walks that sequence and hands back a raw
//! buffer plus the y-inversion flag.

use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::protocol::wl_shm::{self, WlShm};
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::{delegate_noop, Connection, Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols_wlr::screencopy::v1::client::{
    zwlr_screencopy_frame_v1::{self, Flags, ZwlrScreencopyFrameV1},
    zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
};

use super::CaptureError;
use crate::buffer::{bytes_per_pixel, ShmBuffer};
use crate::wayland::{Session, WaylandError};

/// Buffer parameters announced by the compositor.
#[derive(Debug, Clone, Copy)]
struct BufferParams {
    format: wl_shm::Format,
    width: u32,
    height: u32,
    stride: u32,
}

#[derive(Default)]
struct FrameState {
    params: Option<BufferParams>,
    bad_format: Option<u32>,
    buffer_done: bool,
    y_inverted: bool,
    ready: bool,
    failed: bool,
}

impl Dispatch<ZwlrScreencopyFrameV1, ()> for FrameState {
    fn event(
        state: &mut Self,
        _proxy: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_screencopy_frame_v1::Event::Buffer {
                format,
                width,
                height,
                stride,
            } => match format {
                WEnum::Value(format) => {
                    state.params = Some(BufferParams {
                        format,
                        width,
                        height,
                        stride,
                    });
                }
                WEnum::Unknown(raw) => state.bad_format = Some(raw),
            },
            zwlr_screencopy_frame_v1::Event::BufferDone => state.buffer_done = true,
            zwlr_screencopy_frame_v1::Event::Flags { flags } => {
                if let WEnum::Value(flags) = flags {
                    state.y_inverted = flags.contains(Flags::YInvert);
                }
            }
            zwlr_screencopy_frame_v1::Event::Ready { .. } => state.ready = true,
            zwlr_screencopy_frame_v1::Event::Failed => state.failed = true,
            _ => (),
        }
    }
}

delegate_noop!(FrameState: ignore ZwlrScreencopyManagerV1);
delegate_noop!(FrameState: ignore WlShm);
delegate_noop!(FrameState: ignore WlShmPool);
delegate_noop!(FrameState: ignore WlBuffer);

/// What a frame capture produced, before post-processing.
pub struct RawFrame {
    pub buffer: ShmBuffer,
    pub y_inverted: bool,
}

/// The rectangle handed to `capture_output_region`, in the output's logical
/// coordinate space.
#[derive(Debug, Clone, Copy)]
pub struct FrameRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Drives one screencopy frame to completion.
pub fn capture_frame(
    session: &Session,
    output: &WlOutput,
    overlay_cursor: bool,
    region: Option<FrameRegion>,
) -> Result<RawFrame, CaptureError> {
    let mut queue = session.conn.new_event_queue::<FrameState>();
    let qh = queue.handle();

    let manager: ZwlrScreencopyManagerV1 = session.globals.bind(&qh, 1..=3, ()).map_err(|_| {
        WaylandError::UnsupportedProtocol("wlr-screencopy-unstable-v1")
    })?;
    let shm: WlShm = session
        .globals
        .bind(&qh, 1..=1, ())
        .map_err(|_| WaylandError::UnsupportedProtocol("wl_shm"))?;

    let cursor = i32::from(overlay_cursor);
    let frame = match region {
        Some(r) => manager.capture_output_region(
            cursor, output, r.x, r.y, r.width, r.height, &qh, (),
        ),
        None => manager.capture_output(cursor, output, &qh, ()),
    };

    let mut state = FrameState::default();

    // Buffer parameters first; v3 additionally terminates the list with
    // buffer_done.
    let wants_buffer_done = frame.version() >= 3;
    loop {
        queue.blocking_dispatch(&mut state).map_err(WaylandError::from)?;
        if state.failed {
            frame.destroy();
            manager.destroy();
            return Err(CaptureError::CaptureFailed);
        }
        if let Some(raw) = state.bad_format {
            frame.destroy();
            manager.destroy();
            return Err(CaptureError::InvalidFrame(format!(
                "unknown pixel format enumerant {raw:#x}"
            )));
        }
        if state.params.is_some() && (!wants_buffer_done || state.buffer_done) {
            break;
        }
    }

    let Some(params) = state.params else {
        frame.destroy();
        manager.destroy();
        return Err(CaptureError::CaptureFailed);
    };
    let Some(bpp) = bytes_per_pixel(params.format) else {
        frame.destroy();
        manager.destroy();
        return Err(CaptureError::InvalidFrame(format!(
            "unsupported pixel format {:?}",
            params.format
        )));
    };
    if (params.stride as usize) < params.width as usize * bpp {
        frame.destroy();
        manager.destroy();
        return Err(CaptureError::InvalidFrame(format!(
            "stride {} too small for width {} ({:?})",
            params.stride, params.width, params.format
        )));
    }

    let buffer = ShmBuffer::create(
        params.width as i32,
        params.height as i32,
        params.stride as i32,
        params.format,
    )?;

    // The pool is only needed long enough to mint the wl_buffer; the kernel
    // keeps the mapping alive for the compositor.
    let pool = shm.create_pool(buffer.fd(), buffer.size() as i32, &qh, ());
    let wl_buffer = pool.create_buffer(
        0,
        buffer.width(),
        buffer.height(),
        buffer.stride(),
        params.format,
        &qh,
        (),
    );
    pool.destroy();

    frame.copy(&wl_buffer);

    while !state.ready && !state.failed {
        queue.blocking_dispatch(&mut state).map_err(WaylandError::from)?;
    }

    frame.destroy();
    wl_buffer.destroy();
    manager.destroy();

    if state.failed {
        return Err(CaptureError::CaptureFailed);
    }

    Ok(RawFrame {
        buffer,
        y_inverted: state.y_inverted,
    })
}
