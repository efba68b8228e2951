//! flexgrid-core — shared identifiers and controller configuration.
//!
//! Everything the other FlexGrid crates agree on lives here: the id
//! aliases used across the registry and capabilities, and the
//! `ControllerConfig` structure the daemon loads from `flexgrid.toml`.

pub mod config;
pub mod types;

pub use config::{
    BackendKind, ControllerConfig, MachineTypeConfig, StateTimeouts,
};
pub use types::{MachineId, MachineType, SiteId};
