//! Sandboxed execution: a hardened Docker baseline builder, the
//! strict/permissive executor that drives it, and the quota-gated
//! `docker.run` capability handler built on top of both.

pub mod docker_builder;
pub mod docker_capability;
pub mod secure_executor;

pub use docker_builder::DockerRunBuilder;
pub use docker_capability::{DockerCapabilityHandler, DockerRunGrantConfig, DockerRunRequest};
pub use secure_executor::{sanitize_context, ExecutionOutput, SecureExecutor};
