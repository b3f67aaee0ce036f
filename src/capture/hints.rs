//! Compositor-specific hints.
//!
//! wl_output alone does not tell us which output has focus, where the
//! focused window is, or (on some compositors) the real per-monitor scale.
//! Each supported compositor answers through its own channel: Hyprland via
//! `hyprctl -j`, dwl via its IPC protocol, the rest via their socket CLIs.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::Context as _;
use serde::Deserialize;
use wayland_backend::client::ObjectId;
use wayland_client::globals::{registry_queue_init, GlobalListContents};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{delegate_noop, event_created_child, Connection, Dispatch, Proxy, QueueHandle};
use wayland_protocols_wlr::output_management::v1::client::{
    zwlr_output_head_v1::{self, ZwlrOutputHeadV1},
    zwlr_output_manager_v1::{self, ZwlrOutputManagerV1},
    zwlr_output_mode_v1::ZwlrOutputModeV1,
};

use super::CaptureError;
use crate::protocols::dwl_ipc::{
    zdwl_ipc_manager_v2::ZdwlIpcManagerV2,
    zdwl_ipc_output_v2::{self, ZdwlIpcOutputV2},
};
use crate::wayland::{RegistryState, WaylandOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compositor {
    Unknown,
    Hyprland,
    Sway,
    Niri,
    Dwl,
    Scroll,
    Miracle,
}

static DETECTED: OnceLock<Compositor> = OnceLock::new();

/// Identifies the running compositor, caching the answer.
pub fn detect() -> Compositor {
    *DETECTED.get_or_init(detect_uncached)
}

fn socket_exists(var: &str) -> bool {
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .is_some_and(|path| Path::new(&path).exists())
}

fn detect_uncached() -> Compositor {
    if socket_exists("NIRI_SOCKET") {
        return Compositor::Niri;
    }
    if socket_exists("SCROLLSOCK") {
        return Compositor::Scroll;
    }
    if socket_exists("MIRACLESOCK") {
        return Compositor::Miracle;
    }
    if socket_exists("SWAYSOCK") {
        return Compositor::Sway;
    }
    if env::var_os("HYPRLAND_INSTANCE_SIGNATURE").is_some_and(|v| !v.is_empty()) {
        return Compositor::Hyprland;
    }
    if detect_dwl_protocol() {
        return Compositor::Dwl;
    }
    Compositor::Unknown
}

fn detect_dwl_protocol() -> bool {
    let Ok(conn) = Connection::connect_to_env() else {
        return false;
    };
    let Ok((globals, _queue)) = registry_queue_init::<RegistryState>(&conn) else {
        return false;
    };
    globals
        .contents()
        .with_list(|list| list.iter().any(|g| g.interface == "zdwl_ipc_manager_v2"))
}

/// Geometry of the focused window, plus enough of its output's state to crop
/// a whole-output capture down to it.
#[derive(Debug, Clone, Default)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub output: Option<String>,
    pub scale: f64,
    pub output_x: i32,
    pub output_y: i32,
}

/// Resolves the focused window's rectangle.
pub fn active_window() -> Result<WindowGeometry, CaptureError> {
    match detect() {
        Compositor::Hyprland => hyprland_active_window(),
        Compositor::Dwl => dwl_active_window(),
        _ => Err(CaptureError::NotFocused(
            "window capture requires Hyprland or dwl".to_owned(),
        )),
    }
}

/// Name of the focused output, if the compositor will tell us.
pub fn focused_monitor() -> Option<String> {
    match detect() {
        Compositor::Hyprland => hyprland_focused_monitor(),
        Compositor::Sway => workspace_focused_monitor("swaymsg"),
        Compositor::Scroll => workspace_focused_monitor("scrollmsg"),
        Compositor::Miracle => workspace_focused_monitor("miraclemsg"),
        Compositor::Niri => niri_focused_monitor(),
        Compositor::Dwl => dwl_focused_monitor(),
        Compositor::Unknown => None,
    }
}

// =============================================================================
// Hyprland (hyprctl JSON)
// =============================================================================

#[derive(Debug, Deserialize)]
struct HyprlandWindow {
    at: [i32; 2],
    size: [i32; 2],
}

#[derive(Debug, Deserialize)]
struct HyprlandMonitor {
    name: String,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    scale: f64,
    #[serde(default)]
    focused: bool,
}

fn hyprctl_json<T: serde::de::DeserializeOwned>(arg: &str) -> anyhow::Result<T> {
    let output = Command::new("hyprctl")
        .args(["-j", arg])
        .output()
        .with_context(|| format!("error running hyprctl {arg}"))?;
    anyhow::ensure!(output.status.success(), "hyprctl {arg} failed");
    serde_json::from_slice(&output.stdout).with_context(|| format!("error parsing hyprctl {arg}"))
}

fn hyprland_active_window() -> Result<WindowGeometry, CaptureError> {
    let win: HyprlandWindow =
        hyprctl_json("activewindow").map_err(|err| CaptureError::Hints(err))?;
    if win.size[0] <= 0 || win.size[1] <= 0 {
        return Err(CaptureError::NotFocused("no active window".to_owned()));
    }
    Ok(WindowGeometry {
        x: win.at[0],
        y: win.at[1],
        width: win.size[0],
        height: win.size[1],
        ..Default::default()
    })
}

fn hyprland_monitors() -> Option<Vec<HyprlandMonitor>> {
    match hyprctl_json::<Vec<HyprlandMonitor>>("monitors") {
        Ok(monitors) => Some(monitors),
        Err(err) => {
            debug!("hyprland monitor query failed: {err:#}");
            None
        }
    }
}

/// Per-monitor scale as Hyprland reports it.
pub fn hyprland_monitor_scale(name: &str) -> Option<f64> {
    hyprland_monitors()?
        .into_iter()
        .find(|m| m.name == name)
        .map(|m| m.scale)
        .filter(|&s| s > 0.0)
}

/// Monitor position and *logical* size as Hyprland reports it.
pub fn hyprland_monitor_geometry(name: &str) -> Option<(i32, i32, i32, i32)> {
    let monitor = hyprland_monitors()?.into_iter().find(|m| m.name == name)?;
    let logical_w = (f64::from(monitor.width) / monitor.scale) as i32;
    let logical_h = (f64::from(monitor.height) / monitor.scale) as i32;
    Some((monitor.x, monitor.y, logical_w, logical_h))
}

fn hyprland_focused_monitor() -> Option<String> {
    hyprland_monitors()?
        .into_iter()
        .find(|m| m.focused)
        .map(|m| m.name)
}

// =============================================================================
// sway-compatible and niri socket CLIs
// =============================================================================

#[derive(Debug, Deserialize)]
struct SwayWorkspace {
    output: String,
    #[serde(default)]
    focused: bool,
}

fn workspace_focused_monitor(program: &str) -> Option<String> {
    let output = Command::new(program)
        .args(["-t", "get_workspaces"])
        .output()
        .ok()?;
    let workspaces: Vec<SwayWorkspace> = serde_json::from_slice(&output.stdout).ok()?;
    workspaces.into_iter().find(|w| w.focused).map(|w| w.output)
}

#[derive(Debug, Deserialize)]
struct NiriWorkspace {
    output: String,
    #[serde(default)]
    is_focused: bool,
}

fn niri_focused_monitor() -> Option<String> {
    let output = Command::new("niri")
        .args(["msg", "-j", "workspaces"])
        .output()
        .ok()?;
    let workspaces: Vec<NiriWorkspace> = serde_json::from_slice(&output.stdout).ok()?;
    workspaces
        .into_iter()
        .find(|w| w.is_focused)
        .map(|w| w.output)
}

// =============================================================================
// dwl (dwl-ipc-unstable-v2)
// =============================================================================

#[derive(Debug, Default)]
struct DwlOutputState {
    name: String,
    active: bool,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    scalefactor: u32,
    got_frame: bool,
}

#[derive(Default)]
struct DwlQueryState {
    outputs: HashMap<ObjectId, DwlOutputState>,
    names: HashMap<u32, String>,
}

impl Dispatch<wayland_client::protocol::wl_registry::WlRegistry, GlobalListContents>
    for DwlQueryState
{
    fn event(
        _state: &mut Self,
        _proxy: &wayland_client::protocol::wl_registry::WlRegistry,
        _event: wayland_client::protocol::wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wayland_client::protocol::wl_output::WlOutput, u32> for DwlQueryState {
    fn event(
        state: &mut Self,
        _proxy: &WlOutput,
        event: wayland_client::protocol::wl_output::Event,
        data: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wayland_client::protocol::wl_output::Event::Name { name } = event {
            state.names.insert(*data, name);
        }
    }
}

impl Dispatch<ZdwlIpcOutputV2, u32> for DwlQueryState {
    fn event(
        state: &mut Self,
        proxy: &ZdwlIpcOutputV2,
        event: zdwl_ipc_output_v2::Event,
        _data: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let entry = state.outputs.entry(proxy.id()).or_default();
        match event {
            zdwl_ipc_output_v2::Event::Active { active } => entry.active = active != 0,
            zdwl_ipc_output_v2::Event::X { x } => entry.x = x,
            zdwl_ipc_output_v2::Event::Y { y } => entry.y = y,
            zdwl_ipc_output_v2::Event::Width { width } => entry.width = width,
            zdwl_ipc_output_v2::Event::Height { height } => entry.height = height,
            zdwl_ipc_output_v2::Event::Scalefactor { scalefactor } => {
                entry.scalefactor = scalefactor;
            }
            zdwl_ipc_output_v2::Event::Frame => entry.got_frame = true,
            _ => (),
        }
    }
}

delegate_noop!(DwlQueryState: ignore ZdwlIpcManagerV2);

fn dwl_query() -> anyhow::Result<Vec<DwlOutputState>> {
    let conn = Connection::connect_to_env().context("error connecting to the Wayland display")?;
    let (globals, mut queue) = registry_queue_init::<DwlQueryState>(&conn)?;
    let qh = queue.handle();
    let registry = globals.registry();

    let manager: ZdwlIpcManagerV2 = globals
        .bind(&qh, 1..=2, ())
        .context("dwl_ipc_manager not available")?;

    let mut state = DwlQueryState::default();
    let mut wl_outputs = Vec::new();
    for global in globals.contents().clone_list() {
        if global.interface == WlOutput::interface().name {
            let version = global.version.min(4);
            let wl_output =
                registry.bind::<WlOutput, _, _>(global.name, version, &qh, global.name);
            wl_outputs.push((global.name, wl_output));
        }
    }
    anyhow::ensure!(!wl_outputs.is_empty(), "no outputs found");

    // Names arrive before we attach dwl outputs.
    queue.roundtrip(&mut state)?;

    let mut dwl_outputs = Vec::new();
    for (global_name, wl_output) in &wl_outputs {
        let dwl_output = manager.get_output(wl_output, &qh, *global_name);
        dwl_outputs.push((*global_name, dwl_output));
    }

    // dwl terminates each output's state burst with a frame event.
    loop {
        queue.blocking_dispatch(&mut state)?;
        let all_framed = dwl_outputs
            .iter()
            .all(|(_, out)| state.outputs.get(&out.id()).is_some_and(|s| s.got_frame));
        if all_framed {
            break;
        }
    }

    let mut result = Vec::new();
    for (global_name, dwl_output) in dwl_outputs {
        if let Some(mut out) = state.outputs.remove(&dwl_output.id()) {
            out.name = state.names.get(&global_name).cloned().unwrap_or_default();
            result.push(out);
        }
        dwl_output.release();
    }
    manager.release();

    Ok(result)
}

fn dwl_focused_monitor() -> Option<String> {
    match dwl_query() {
        Ok(outputs) => outputs.into_iter().find(|o| o.active).map(|o| o.name),
        Err(err) => {
            debug!("dwl focus query failed: {err:#}");
            None
        }
    }
}

fn dwl_active_window() -> Result<WindowGeometry, CaptureError> {
    let outputs = dwl_query().map_err(CaptureError::Hints)?;

    let active = outputs
        .into_iter()
        .find(|o| o.active)
        .ok_or_else(|| CaptureError::NotFocused("no active output found".to_owned()))?;
    if active.width <= 0 || active.height <= 0 {
        return Err(CaptureError::NotFocused("no active window".to_owned()));
    }

    let scale = match active.scalefactor {
        0 => 1.0,
        s => f64::from(s) / 100.0,
    };

    let mut geom = WindowGeometry {
        x: active.x,
        y: active.y,
        width: active.width,
        height: active.height,
        output: Some(active.name.clone()),
        scale,
        output_x: 0,
        output_y: 0,
    };

    if let Some((x, y)) = output_position(&active.name) {
        geom.output_x = x;
        geom.output_y = y;
    }

    Ok(geom)
}

// =============================================================================
// wlr-output-management (output position for dwl placement)
// =============================================================================

#[derive(Debug, Default)]
struct HeadState {
    name: String,
    x: i32,
    y: i32,
}

#[derive(Default)]
struct OutputInfoState {
    heads: HashMap<ObjectId, HeadState>,
    done: bool,
}

impl Dispatch<wayland_client::protocol::wl_registry::WlRegistry, GlobalListContents>
    for OutputInfoState
{
    fn event(
        _state: &mut Self,
        _proxy: &wayland_client::protocol::wl_registry::WlRegistry,
        _event: wayland_client::protocol::wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwlrOutputManagerV1, ()> for OutputInfoState {
    fn event(
        state: &mut Self,
        _proxy: &ZwlrOutputManagerV1,
        event: zwlr_output_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_output_manager_v1::Event::Head { head } => {
                state.heads.insert(head.id(), HeadState::default());
            }
            zwlr_output_manager_v1::Event::Done { .. } => state.done = true,
            _ => (),
        }
    }

    event_created_child!(OutputInfoState, ZwlrOutputManagerV1, [
        zwlr_output_manager_v1::EVT_HEAD_OPCODE => (ZwlrOutputHeadV1, ()),
    ]);
}

impl Dispatch<ZwlrOutputHeadV1, ()> for OutputInfoState {
    fn event(
        state: &mut Self,
        proxy: &ZwlrOutputHeadV1,
        event: zwlr_output_head_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(head) = state.heads.get_mut(&proxy.id()) else {
            return;
        };
        match event {
            zwlr_output_head_v1::Event::Name { name } => head.name = name,
            zwlr_output_head_v1::Event::Position { x, y } => {
                head.x = x;
                head.y = y;
            }
            _ => (),
        }
    }

    event_created_child!(OutputInfoState, ZwlrOutputHeadV1, [
        zwlr_output_head_v1::EVT_MODE_OPCODE => (ZwlrOutputModeV1, ()),
    ]);
}

delegate_noop!(OutputInfoState: ignore ZwlrOutputModeV1);

/// Queries an output's position through wlr-output-management.
pub fn output_position(output_name: &str) -> Option<(i32, i32)> {
    let conn = Connection::connect_to_env().ok()?;
    let (globals, mut queue) = registry_queue_init::<OutputInfoState>(&conn).ok()?;
    let qh = queue.handle();

    let _manager: ZwlrOutputManagerV1 = globals.bind(&qh, 1..=4, ()).ok()?;

    let mut state = OutputInfoState::default();
    while !state.done {
        queue.blocking_dispatch(&mut state).ok()?;
    }

    state
        .heads
        .into_values()
        .find(|h| h.name == output_name)
        .map(|h| (h.x, h.y))
}

/// Physical placement of an output in the mosaic, honoring compositor hints.
pub fn physical_placement(output: &WaylandOutput) -> (i32, i32, f64) {
    let mut x = output.x;
    let mut y = output.y;
    let mut scale = f64::from(output.scale);

    match detect() {
        Compositor::Hyprland => {
            if let Some((hx, hy, _, _)) = hyprland_monitor_geometry(&output.name) {
                x = hx;
                y = hy;
            }
            if let Some(s) = hyprland_monitor_scale(&output.name) {
                scale = s;
            }
        }
        Compositor::Dwl => {
            if let Some((ox, oy)) = output_position(&output.name) {
                x = ox;
                y = oy;
            }
        }
        _ => (),
    }

    if scale <= 0.0 {
        scale = 1.0;
    }

    (
        (f64::from(x) * scale) as i32,
        (f64::from(y) * scale) as i32,
        scale,
    )
}
