//! dwl-ipc-unstable-v2 client bindings.
//!
//! dwl exposes the focused client's geometry and the output scale through
//! this protocol (dwl patchset, version 2). The XML lives in `resources/`.

#![allow(missing_docs, clippy::all)]

use wayland_client;
use wayland_client::protocol::*;

pub mod __interfaces {
    use wayland_client::protocol::__interfaces::*;
    wayland_scanner::generate_interfaces!("resources/dwl-ipc-unstable-v2.xml");
}
use self::__interfaces::*;

wayland_scanner::generate_client_code!("resources/dwl-ipc-unstable-v2.xml");
