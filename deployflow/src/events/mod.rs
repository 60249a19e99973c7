//! Event sinks for observability.
//!
//! The delivery pipeline and the ingestion consumer report their progress as
//! named events. Sinks decide what to do with them: drop, log, or collect.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
