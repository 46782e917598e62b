//! Async operation runner.
//!
//! [`RequestRunner`] wraps an async operation and adds manual/automatic
//! triggering, parameter tracking, a delayed busy flag, debounce/throttle gating,
//! interval polling with bounded error retry, and cooperative cancellation.

pub mod engine;
pub mod metrics;
pub mod model;

pub use engine::{Invocation, RequestRunner, RunError, RunnerBuilder, Value};
pub use model::{InvocationGate, RunnerConfig};
