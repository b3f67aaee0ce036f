//! Client bindings for protocols not shipped by the wayland-protocols crates.

pub mod dwl_ipc;
