//! Application-level orchestration.
//!
//! Owns run lifecycle control (start/stop/quit) between the dashboard and
//! the engine. UI layers send commands in and fold the events that come
//! back.

mod controller;

pub(crate) use controller::{run_controller, UiCommand};
