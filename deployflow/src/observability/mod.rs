//! Logging setup and span helpers.

mod spans;
mod subscriber;

pub use spans::{RunSpanAttributes, SpanTimer};
pub use subscriber::{init_tracing, LogFormat};
