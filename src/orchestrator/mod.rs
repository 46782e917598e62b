//! Application-level orchestration utilities.
//!
//! This module owns runner lifecycle control (commands, outcome reporting, shutdown)
//! and post-session processing such as report building and exports. The CLI layer
//! calls into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, Command, ControllerOptions, FetchRunner};
pub(crate) use post_process::process_session;
