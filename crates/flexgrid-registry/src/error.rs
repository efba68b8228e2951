//! Registry and snapshot error types.

use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The caller asked for a machine type the registry was not
    /// configured with.
    #[error("unknown machine type: {0}")]
    UnknownMachineType(String),

    /// The requested edge is not in the lifecycle graph. The machine's
    /// state is left unchanged.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// Two machines under the same site backend may never share a
    /// site id.
    #[error("duplicate site id {site_id} under site {site}")]
    DuplicateSiteId { site: String, site_id: String },

    #[error("machine not found: {0}")]
    NotFound(String),
}

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to open snapshot database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
