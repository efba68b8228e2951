//! Identifier aliases shared across FlexGrid crates.

/// Process-unique identifier for a managed machine (`m-<n>`).
pub type MachineId = String;

/// Named machine flavor; maps to provisioning parameters and a demand unit.
pub type MachineType = String;

/// Identifier assigned by a site backend once provisioning is accepted.
pub type SiteId = String;
