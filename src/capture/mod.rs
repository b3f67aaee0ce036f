//! Screen capture driver.
//!
//! Implements the capture modes on top of wlr-screencopy: single outputs,
//! logical regions (including regions on rotated outputs), the focused
//! window resolved through compositor IPC, and the composited all-screens
//! mosaic.

use wayland_client::protocol::wl_shm;

use crate::buffer::{apply_transform, inverse_transform, BufferError, ShmBuffer};
use crate::region::{load_last_region, save_last_region, Region};
use crate::wayland::{Session, WaylandError, WaylandOutput};

pub mod frame;
pub mod hints;
mod mosaic;

use frame::FrameRegion;
use hints::Compositor;

/// Capture failure kinds surfaced to the caller. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Wayland(#[from] WaylandError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("screencopy frame capture failed")]
    CaptureFailed,
    #[error("compositor sent an invalid frame: {0}")]
    InvalidFrame(String),
    #[error("output {0:?} not found")]
    OutputNotFound(String),
    #[error("region not visible on output")]
    RegionNotVisible,
    #[error("{0}")]
    NotFocused(String),
    #[error("compositor hint query failed: {0}")]
    Hints(anyhow::Error),
}

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Interactive region selection.
    Region,
    /// The focused window.
    Window,
    /// The focused output.
    FullScreen,
    /// Every output, composited into one mosaic.
    AllScreens,
    /// A specific output by name.
    Output(String),
    /// The previously selected region, selector skipped.
    LastRegion,
}

/// A finished capture. Immutable once produced; the format is always the
/// post-conversion 32-bit format.
pub struct CaptureResult {
    pub buffer: ShmBuffer,
    pub region: Region,
    pub y_inverted: bool,
    pub format: wl_shm::Format,
}

/// One connection's worth of capture state.
pub struct Screenshoter {
    session: Session,
    include_cursor: bool,
}

impl Screenshoter {
    pub fn new(include_cursor: bool) -> Result<Self, CaptureError> {
        let session = Session::connect()?;

        let has_screencopy = session.globals.contents().with_list(|list| {
            list.iter()
                .any(|g| g.interface == "zwlr_screencopy_manager_v1")
        });
        if !has_screencopy {
            return Err(WaylandError::UnsupportedProtocol("wlr-screencopy-unstable-v1").into());
        }

        Ok(Self {
            session,
            include_cursor,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Runs one capture. `Ok(None)` means the user cancelled an interactive
    /// selection, which is not an error.
    pub fn run(&mut self, mode: &Mode) -> Result<Option<CaptureResult>, CaptureError> {
        match mode {
            Mode::LastRegion => self.capture_last_region(),
            Mode::Region => self.capture_region(),
            Mode::Window => self.capture_window().map(Some),
            Mode::Output(name) => self.capture_output(name).map(Some),
            Mode::FullScreen => self.capture_full_screen().map(Some),
            Mode::AllScreens => self.capture_all_screens().map(Some),
        }
    }

    fn capture_last_region(&mut self) -> Result<Option<CaptureResult>, CaptureError> {
        let last = load_last_region();
        if last.is_empty() {
            return self.capture_region();
        }

        let Some(output) = self.find_output_for_region(&last).cloned() else {
            return self.capture_region();
        };

        self.capture_region_on_output(&output, last).map(Some)
    }

    fn capture_region(&mut self) -> Result<Option<CaptureResult>, CaptureError> {
        let result = crate::selector::select_region(&self.session, self.include_cursor)?;

        if let Some(result) = &result {
            if let Err(err) = save_last_region(&result.region) {
                debug!("failed to save last region: {err:#}");
            }
        }

        Ok(result)
    }

    fn capture_window(&mut self) -> Result<CaptureResult, CaptureError> {
        let geom = hints::active_window()?;

        let region = Region::new(geom.x, geom.y, geom.width, geom.height);

        let output = geom
            .output
            .as_deref()
            .and_then(|name| self.session.find_output_by_name(name))
            .or_else(|| self.find_output_for_region(&region))
            .cloned()
            .ok_or_else(|| CaptureError::OutputNotFound("window's output".to_owned()))?;

        match hints::detect() {
            Compositor::Hyprland => self.capture_and_crop(&output, region),
            Compositor::Dwl => self.capture_dwl_window(&output, region, &geom),
            _ => self.capture_region_on_output(&output, region),
        }
    }

    fn capture_full_screen(&mut self) -> Result<CaptureResult, CaptureError> {
        let output = hints::focused_monitor()
            .and_then(|name| self.session.find_output_by_name(&name))
            .or_else(|| self.session.outputs().first())
            .cloned()
            .ok_or(WaylandError::NoOutputs)?;

        self.capture_whole_output(&output)
    }

    fn capture_output(&mut self, name: &str) -> Result<CaptureResult, CaptureError> {
        let output = self
            .session
            .find_output_by_name(name)
            .cloned()
            .ok_or_else(|| CaptureError::OutputNotFound(name.to_owned()))?;

        self.capture_whole_output(&output)
    }

    fn capture_all_screens(&mut self) -> Result<CaptureResult, CaptureError> {
        let outputs: Vec<WaylandOutput> = self.session.outputs().to_vec();
        if outputs.is_empty() {
            return Err(WaylandError::NoOutputs.into());
        }
        if outputs.len() == 1 {
            return self.capture_whole_output(&outputs[0]);
        }

        let mut placed = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let result = match self.capture_whole_output(output) {
                Ok(result) => result,
                Err(err) => {
                    warn!("failed to capture output {}: {err}", output.name);
                    continue;
                }
            };
            let (phys_x, phys_y, _scale) = hints::physical_placement(output);
            placed.push(mosaic::PlacedCapture {
                result,
                phys_x,
                phys_y,
            });
        }

        mosaic::composite(placed)
    }

    /// Captures one output whole and post-processes it upright: 24-bit
    /// expansion, y-flip, inverse output transform.
    pub fn capture_whole_output(
        &self,
        output: &WaylandOutput,
    ) -> Result<CaptureResult, CaptureError> {
        let raw = frame::capture_frame(&self.session, &output.wl_output, self.include_cursor, None)?;

        let mut buffer = raw.buffer.convert_to_32bit()?;
        if raw.y_inverted {
            buffer.flip_vertical();
        }

        let mut region = Region {
            x: output.x,
            y: output.y,
            width: output.width,
            height: output.height,
            output: Some(output.name.clone()),
        };

        if output.transform != wayland_client::protocol::wl_output::Transform::Normal {
            buffer = apply_transform(buffer, inverse_transform(output.transform))?;
            region.width = buffer.width();
            region.height = buffer.height();
        }

        let format = buffer.format();
        Ok(CaptureResult {
            buffer,
            region,
            y_inverted: false,
            format,
        })
    }

    /// Captures a logical region on an output.
    ///
    /// On transformed outputs `capture_output_region` cannot be used
    /// directly, so the whole output is captured, untransformed, and
    /// cropped.
    pub fn capture_region_on_output(
        &self,
        output: &WaylandOutput,
        region: Region,
    ) -> Result<CaptureResult, CaptureError> {
        if output.transform != wayland_client::protocol::wl_output::Transform::Normal {
            return self.capture_region_on_transformed_output(output, region);
        }

        let scale = self.region_scale(output);

        let mut local_x = (f64::from(region.x - output.x) * scale) as i32;
        let mut local_y = (f64::from(region.y - output.y) * scale) as i32;
        let mut w = (f64::from(region.width) * scale) as i32;
        let mut h = (f64::from(region.height) * scale) as i32;

        if hints::detect() == Compositor::Dwl {
            // dwl hands out logical coordinates past the output extent for
            // offscreen tags; wrap and clamp them back in.
            let scaled_w = (f64::from(output.width) * scale) as i32;
            let scaled_h = (f64::from(output.height) * scale) as i32;
            if scaled_w > 0 && local_x >= scaled_w {
                local_x %= scaled_w;
            }
            if scaled_h > 0 && local_y >= scaled_h {
                local_y %= scaled_h;
            }
            if local_x + w > scaled_w {
                w = scaled_w - local_x;
            }
            if local_y + h > scaled_h {
                h = scaled_h - local_y;
            }
            if local_x < 0 {
                w += local_x;
                local_x = 0;
            }
            if local_y < 0 {
                h += local_y;
                local_y = 0;
            }
        }

        if w <= 0 || h <= 0 {
            return Err(CaptureError::RegionNotVisible);
        }

        let raw = frame::capture_frame(
            &self.session,
            &output.wl_output,
            self.include_cursor,
            Some(FrameRegion {
                x: local_x,
                y: local_y,
                width: w,
                height: h,
            }),
        )?;

        let buffer = raw.buffer.convert_to_32bit()?;
        let format = buffer.format();
        Ok(CaptureResult {
            buffer,
            region,
            y_inverted: raw.y_inverted,
            format,
        })
    }

    fn capture_region_on_transformed_output(
        &self,
        output: &WaylandOutput,
        region: Region,
    ) -> Result<CaptureResult, CaptureError> {
        let whole = self.capture_whole_output(output)?;

        let scale = self.region_scale(output);
        let local_x = (f64::from(region.x - output.x) * scale) as i32;
        let local_y = (f64::from(region.y - output.y) * scale) as i32;
        let w = (f64::from(region.width) * scale) as i32;
        let h = (f64::from(region.height) * scale) as i32;

        let cropped = whole
            .buffer
            .crop(local_x, local_y, w, h)
            .ok_or(CaptureError::RegionNotVisible)?;

        Ok(CaptureResult {
            format: cropped.format(),
            buffer: cropped,
            region,
            y_inverted: false,
        })
    }

    /// Hyprland window path: whole-output capture cropped in scaled logical
    /// coordinates from hyprctl.
    fn capture_and_crop(
        &self,
        output: &WaylandOutput,
        region: Region,
    ) -> Result<CaptureResult, CaptureError> {
        let whole = self.capture_whole_output(output)?;

        let (mut out_x, mut out_y) = (output.x, output.y);
        if let Some((hx, hy, _, _)) = hints::hyprland_monitor_geometry(&output.name) {
            out_x = hx;
            out_y = hy;
        }
        let scale = hints::hyprland_monitor_scale(&output.name)
            .unwrap_or_else(|| output.effective_scale())
            .max(f64::MIN_POSITIVE);

        let local_x = (f64::from(region.x - out_x) * scale) as i32;
        let local_y = (f64::from(region.y - out_y) * scale) as i32;
        let w = (f64::from(region.width) * scale) as i32;
        let h = (f64::from(region.height) * scale) as i32;

        let cropped = whole
            .buffer
            .crop(local_x, local_y, w, h)
            .ok_or(CaptureError::RegionNotVisible)?;

        Ok(CaptureResult {
            format: cropped.format(),
            buffer: cropped,
            region,
            y_inverted: false,
        })
    }

    /// dwl window path: whole-output capture cropped with dwl's per-output
    /// scalefactor.
    fn capture_dwl_window(
        &self,
        output: &WaylandOutput,
        region: Region,
        geom: &hints::WindowGeometry,
    ) -> Result<CaptureResult, CaptureError> {
        let whole = self.capture_whole_output(output)?;

        let mut scale = geom.scale;
        if scale <= 0.0 || scale == 1.0 {
            if output.fractional_scale > 1.0 {
                scale = output.fractional_scale;
            }
        }
        if scale <= 0.0 {
            scale = 1.0;
        }

        let local_x = (f64::from(region.x - geom.output_x) * scale) as i32;
        let local_y = (f64::from(region.y - geom.output_y) * scale) as i32;
        let w = (f64::from(region.width) * scale) as i32;
        let h = (f64::from(region.height) * scale) as i32;

        let cropped = whole
            .buffer
            .crop(local_x, local_y, w, h)
            .ok_or_else(|| CaptureError::NotFocused("window not visible on output".to_owned()))?;

        Ok(CaptureResult {
            format: cropped.format(),
            buffer: cropped,
            region,
            y_inverted: false,
        })
    }

    fn region_scale(&self, output: &WaylandOutput) -> f64 {
        let mut scale = output.fractional_scale;
        if scale <= 0.0 && hints::detect() == Compositor::Hyprland {
            scale = hints::hyprland_monitor_scale(&output.name).unwrap_or(0.0);
        }
        if scale <= 0.0 {
            scale = f64::from(output.scale);
        }
        if scale <= 0.0 {
            scale = 1.0;
        }
        scale
    }

    /// The output a region belongs to: containment of the region's center
    /// first, then of its top-left corner.
    pub fn find_output_for_region(&self, region: &Region) -> Option<&WaylandOutput> {
        let cx = region.x + region.width / 2;
        let cy = region.y + region.height / 2;

        let geometry = |o: &WaylandOutput| -> (i32, i32, i32, i32) {
            if hints::detect() == Compositor::Hyprland {
                if let Some(geo) = hints::hyprland_monitor_geometry(&o.name) {
                    return geo;
                }
            }
            (o.x, o.y, o.width, o.height)
        };

        self.session
            .outputs()
            .iter()
            .find(|o| {
                let (x, y, w, h) = geometry(o);
                cx >= x && cx < x + w && cy >= y && cy < y + h
            })
            .or_else(|| {
                self.session.outputs().iter().find(|o| {
                    let (x, y, w, h) = geometry(o);
                    region.x >= x && region.x < x + w && region.y >= y && region.y < y + h
                })
            })
    }
}

/// Lists outputs with compositor hints applied, for the `outputs`
/// subcommand and shell-side consumers.
pub fn list_outputs() -> Result<Vec<OutputInfo>, CaptureError> {
    let session = Session::connect()?;
    let compositor = hints::detect();

    Ok(session
        .outputs()
        .iter()
        .map(|o| {
            let mut info = OutputInfo {
                name: o.name.clone(),
                x: o.x,
                y: o.y,
                width: o.width,
                height: o.height,
                scale: o.scale,
                fractional_scale: o.fractional_scale,
                transform: o.transform,
            };

            if compositor == Compositor::Hyprland {
                if let Some((hx, hy, hw, hh)) = hints::hyprland_monitor_geometry(&o.name) {
                    info.x = hx;
                    info.y = hy;
                    info.width = hw;
                    info.height = hh;
                }
                if let Some(s) = hints::hyprland_monitor_scale(&o.name) {
                    info.fractional_scale = s;
                }
            }

            info
        })
        .collect())
}

/// A snapshot of one output for listing.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub scale: i32,
    pub fractional_scale: f64,
    pub transform: wayland_client::protocol::wl_output::Transform,
}
