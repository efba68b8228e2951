//! flexgrid-capability — the seams to the outside world.
//!
//! Three small contracts cover everything the controller needs from a
//! concrete backend:
//!
//! - [`RequirementCapability`] reports demand from a batch system,
//! - [`SiteCapability`] provisions, inspects, and terminates machines
//!   against one compute backend,
//! - [`IntegrationCapability`] registers booted machines as batch
//!   workers and reports their idle/working status.
//!
//! Concrete backends are a closed set of variants selected by
//! configuration, never discovered at runtime. The built-in
//! [`sim`] backends serve tests and the daemon's simulate mode.
//!
//! Trait methods return boxed futures so capability instances stay
//! dyn-compatible and can be held behind `Arc<dyn …>` in mixed sets.

pub mod contract;
pub mod error;
pub mod sim;

pub use contract::{
    BatchStatus, CapFuture, IntegrationCapability, RequirementCapability, SiteCapability,
    SiteStatus,
};
pub use error::{CapabilityError, CapabilityResult};
pub use sim::{SimIntegration, SimSite, StaticRequirement};
