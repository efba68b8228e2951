//! The three capability contracts.

use std::future::Future;
use std::pin::Pin;

use flexgrid_registry::Machine;

use crate::error::CapabilityError;

/// Boxed future alias for capability call results.
pub type CapFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CapabilityError>> + Send + 'a>>;

/// Machine status as reported by a site backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    /// The backend runs the machine.
    Running,
    /// The backend reports the machine broken.
    Error,
    /// The backend no longer runs the machine.
    Terminated,
    /// The backend cannot say right now; treat as no news.
    Unknown,
}

/// Worker status as reported by an integration backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Registered worker with no jobs. `idle_since` is the Unix
    /// timestamp the worker last went idle, used for
    /// longest-idle-first retirement.
    Idle { idle_since: u64 },
    /// Registered worker currently running jobs.
    Working,
    /// Worker is being drained out of scheduling.
    Draining,
    /// Not registered, or the batch system cannot say.
    Unknown,
}

/// Reports current demand from one batch system.
pub trait RequirementCapability: Send + Sync {
    /// Logical instance name, as referenced from configuration.
    fn name(&self) -> &str;

    /// Required machine count for the given type. Fails with
    /// [`CapabilityError::Unavailable`] on transient backend errors —
    /// never silently returns stale data.
    fn get_demand<'a>(&'a self, machine_type: &'a str) -> CapFuture<'a, f64>;
}

/// Provisions, inspects, and terminates machines against one compute
/// backend (a cloud region, a virtualization cluster, …).
pub trait SiteCapability: Send + Sync {
    /// Logical instance name, as referenced from configuration.
    fn name(&self) -> &str;

    /// Request a new machine of the given type. On acceptance returns
    /// the backend-assigned site id; the request is irrevocable once
    /// accepted.
    fn provision<'a>(&'a self, machine_type: &'a str) -> CapFuture<'a, String>;

    /// Current backend status of a provisioned machine.
    fn query_status<'a>(&'a self, site_id: &'a str) -> CapFuture<'a, SiteStatus>;

    /// Tear the machine down. Must only be issued after the owning
    /// integration backend deregistered the machine.
    fn terminate<'a>(&'a self, site_id: &'a str) -> CapFuture<'a, ()>;
}

/// Registers booted machines as usable workers inside one batch system
/// and reports per-machine batch status.
pub trait IntegrationCapability: Send + Sync {
    /// Logical instance name, as referenced from configuration.
    fn name(&self) -> &str;

    /// Make the machine known to the batch system as a worker.
    fn register<'a>(&'a self, machine: &'a Machine) -> CapFuture<'a, ()>;

    /// Batch-system status of a registered machine.
    fn query_status<'a>(&'a self, machine: &'a Machine) -> CapFuture<'a, BatchStatus>;

    /// Remove the machine from batch scheduling. Implementations must
    /// treat a machine that is already gone as successfully
    /// deregistered, so retirement can always deregister before it
    /// terminates.
    fn deregister<'a>(&'a self, machine: &'a Machine) -> CapFuture<'a, ()>;
}
