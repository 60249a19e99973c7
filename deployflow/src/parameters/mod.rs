//! External configuration: parameter names, sources, and the cross-region
//! reader.

pub mod names;
mod reader;
mod source;

pub use reader::{CrossRegionParameterReader, ParameterRead};
pub use source::{ConfigurationSource, InMemoryParameterStore, ParameterPublisher};
