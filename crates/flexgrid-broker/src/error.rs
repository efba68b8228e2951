//! Broker error types.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that abort broker construction or a whole cycle.
///
/// Capability failures never show up here — they are converted to
/// events and local state adjustments inside the cycle. What remains is
/// wiring mistakes and registry/snapshot corruption.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("machine type {machine_type} references unknown site backend {site}")]
    UnknownSite { machine_type: String, site: String },

    #[error("machine type {machine_type} references unknown integration backend {integration}")]
    UnknownIntegration {
        machine_type: String,
        integration: String,
    },

    #[error("machine type {machine_type} references unknown requirement backend {requirement}")]
    UnknownRequirement {
        machine_type: String,
        requirement: String,
    },

    #[error("registry error: {0}")]
    Registry(#[from] flexgrid_registry::RegistryError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] flexgrid_registry::SnapshotError),
}
