pub mod adapter;
pub mod artifact;
pub mod error;
pub mod hub;
pub mod model;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod telemetry;

pub use error::CoreError;
pub use model::{BackendKind, Capability, ModelEntry};
pub use registry::Registry;
pub use router::Router;
