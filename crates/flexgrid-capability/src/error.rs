//! Capability error taxonomy.
//!
//! Transient unavailability is retried next cycle; a rejected operation
//! forces the affected machine to `failed` and is never retried on the
//! same request. Neither ever propagates out of a broker cycle.

use thiserror::Error;

pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    /// Transient remote failure or per-call timeout. The affected
    /// machines keep their stale state for this cycle.
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    /// Site backend rejected a provisioning request.
    #[error("provisioning rejected: {0}")]
    Provision(String),

    /// Site backend failed to terminate a machine.
    #[error("termination failed: {0}")]
    Terminate(String),

    /// Integration backend rejected a worker registration.
    #[error("registration failed: {0}")]
    Register(String),

    /// Integration backend failed to deregister a worker.
    #[error("deregistration failed: {0}")]
    Deregister(String),
}
