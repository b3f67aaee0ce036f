//! Wayland connection plumbing shared by the capture driver and the region
//! selector.
//!
//! A [`Session`] owns the connection and the initial global list. Components
//! create their own event queues on top of it, so each state machine
//! dispatches only the events it cares about.

use wayland_client::globals::{registry_queue_init, GlobalList, GlobalListContents};
use wayland_client::protocol::wl_output::{self, Transform, WlOutput};
use wayland_client::protocol::wl_registry;
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};

/// Failures in session setup and dispatch, named so callers can produce
/// messages like "compositor does not support wlr-screencopy-unstable-v1".
#[derive(Debug, thiserror::Error)]
pub enum WaylandError {
    #[error("error connecting to the Wayland display: {0}")]
    Connect(#[from] wayland_client::ConnectError),
    #[error("compositor does not support {0}")]
    UnsupportedProtocol(&'static str),
    #[error("compositor did not advertise any outputs")]
    NoOutputs,
    #[error("wayland dispatch error: {0}")]
    Dispatch(#[from] wayland_client::DispatchError),
    #[error("wayland global error: {0}")]
    Global(#[from] wayland_client::globals::GlobalError),
}

/// One wl_output as the compositor advertises it.
///
/// Created when the global appears, mutated only by output events, dropped
/// on global-remove.
#[derive(Debug, Clone)]
pub struct WaylandOutput {
    pub wl_output: WlOutput,
    pub global_name: u32,
    pub name: String,
    /// Logical position in the compositor space.
    pub x: i32,
    pub y: i32,
    /// Current mode, in physical pixels.
    pub width: i32,
    pub height: i32,
    pub scale: i32,
    pub fractional_scale: f64,
    pub transform: Transform,
}

impl WaylandOutput {
    fn new(wl_output: WlOutput, global_name: u32) -> Self {
        Self {
            wl_output,
            global_name,
            name: String::new(),
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            scale: 1,
            fractional_scale: 1.0,
            transform: Transform::Normal,
        }
    }

    /// Best known scale for logical-to-buffer conversions.
    pub fn effective_scale(&self) -> f64 {
        if self.fractional_scale > 0.0 {
            self.fractional_scale
        } else if self.scale > 0 {
            f64::from(self.scale)
        } else {
            1.0
        }
    }

    /// Applies an output event to this record.
    pub fn apply_event(&mut self, event: wl_output::Event) {
        match event {
            wl_output::Event::Geometry {
                x, y, transform, ..
            } => {
                self.x = x;
                self.y = y;
                if let WEnum::Value(transform) = transform {
                    self.transform = transform;
                }
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                ..
            } => {
                if let WEnum::Value(flags) = flags {
                    if flags.contains(wl_output::Mode::Current) {
                        self.width = width;
                        self.height = height;
                    }
                }
            }
            wl_output::Event::Scale { factor } => {
                self.scale = factor;
                self.fractional_scale = f64::from(factor);
            }
            wl_output::Event::Name { name } => {
                self.name = name;
            }
            _ => (),
        }
    }
}

/// The connection, its registry, and the tracked outputs.
pub struct Session {
    pub conn: Connection,
    pub globals: GlobalList,
    outputs: Vec<WaylandOutput>,
}

pub(crate) struct RegistryState;

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for RegistryState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

struct OutputQueryState {
    outputs: Vec<WaylandOutput>,
}

impl Dispatch<wl_output::WlOutput, u32> for OutputQueryState {
    fn event(
        state: &mut Self,
        _proxy: &WlOutput,
        event: wl_output::Event,
        data: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let Some(output) = state.outputs.iter_mut().find(|o| o.global_name == *data) {
            output.apply_event(event);
        }
    }
}

impl Session {
    /// Connects to the compositor and enumerates outputs.
    pub fn connect() -> Result<Self, WaylandError> {
        let conn = Connection::connect_to_env()?;
        let (globals, _queue) = registry_queue_init::<RegistryState>(&conn)?;

        let mut session = Self {
            conn,
            globals,
            outputs: Vec::new(),
        };
        session.refresh_outputs()?;
        Ok(session)
    }

    /// Re-reads the output list and its per-output state.
    pub fn refresh_outputs(&mut self) -> Result<(), WaylandError> {
        let mut event_queue = self.conn.new_event_queue::<OutputQueryState>();
        let qh = event_queue.handle();
        let registry = self.globals.registry();

        let mut state = OutputQueryState {
            outputs: Vec::new(),
        };
        for global in self.globals.contents().clone_list() {
            if global.interface == WlOutput::interface().name {
                let version = global.version.min(4);
                let wl_output =
                    registry.bind::<WlOutput, _, _>(global.name, version, &qh, global.name);
                state.outputs.push(WaylandOutput::new(wl_output, global.name));
            }
        }

        if state.outputs.is_empty() {
            return Err(WaylandError::NoOutputs);
        }

        // One roundtrip delivers geometry/mode/scale, a second settles names
        // on compositors that send them late.
        event_queue.roundtrip(&mut state)?;
        event_queue.roundtrip(&mut state)?;

        trace!("outputs detected: {:?}", state.outputs);
        self.outputs = state.outputs;
        Ok(())
    }

    pub fn outputs(&self) -> &[WaylandOutput] {
        &self.outputs
    }

    pub fn find_output_by_name(&self, name: &str) -> Option<&WaylandOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }
}
