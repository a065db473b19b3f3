//! Flow definitions and their loader.

pub mod definition;
pub mod loader;

pub use definition::{FlowDefinition, FlowSource, FlowStep};
pub use loader::{FlowLoadError, FlowLoadReport, FlowLoader};
