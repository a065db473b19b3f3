//! Unix-domain-socket sidechannels mounted into every sandboxed container:
//! an egress proxy gating outbound network I/O and a capability proxy
//! gating everything else a pack can ask the kernel to do on its behalf.
//!
//! Grounded on spec sections 4.9/4.10.

pub mod capability;
pub mod egress;
pub mod protocol;

pub use capability::{ActionQuota, CapabilityHandlerFn, CapabilityProxy};
pub use egress::EgressProxy;
