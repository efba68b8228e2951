//! flexgrid-registry — the authoritative machine table.
//!
//! Holds every machine the controller knows about and its lifecycle
//! state. All mutation goes through transition operations that validate
//! against the lifecycle graph; there is no other write path. The
//! registry enforces structural legality only — time-based policy
//! (state timeouts) belongs to the broker.
//!
//! # Lifecycle graph
//!
//! ```text
//! requested → booting → up → integrating → working → disintegrating → disintegrated
//!                                                          │
//!     (any non-terminal) ──→ failed ──→ down ←─────────────┘
//! ```
//!
//! An optional redb-backed snapshot persists the table across restarts;
//! it is loaded before the first cycle and rewritten after each one.

pub mod error;
pub mod machine;
pub mod registry;
pub mod snapshot;
mod tables;

pub use error::{RegistryError, RegistryResult, SnapshotError, SnapshotResult};
pub use machine::{Machine, MachineState};
pub use registry::MachineRegistry;
pub use snapshot::RegistrySnapshot;
