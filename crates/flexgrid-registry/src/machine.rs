//! Machine record and lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use flexgrid_core::{MachineId, MachineType, SiteId};

/// Coarse lifecycle state recognized by the core. Site and integration
/// backends may track finer substates in `backend_attributes`; the
/// controller only reasons about this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// Scale-up decision made, provisioning not yet accepted.
    Requested,
    /// Provisioning accepted by the site backend; machine is coming up.
    Booting,
    /// Site reports the machine running; not yet part of the batch system.
    Up,
    /// Registration with the batch system submitted.
    Integrating,
    /// Usable worker inside the batch system.
    Working,
    /// Selected for retirement; draining and deregistration in progress.
    Disintegrating,
    /// Torn down cleanly; terminal.
    Disintegrated,
    /// Something went wrong; awaiting cleanup.
    Failed,
    /// Forced removal; terminal.
    Down,
}

impl MachineState {
    /// Terminal states permit `remove` and nothing else.
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineState::Disintegrated | MachineState::Down)
    }

    /// Whether the edge `self -> next` is in the lifecycle graph.
    pub fn can_advance_to(self, next: MachineState) -> bool {
        use MachineState::*;
        // Failed is reachable from any non-terminal state.
        if next == Failed {
            return !self.is_terminal() && self != Failed;
        }
        matches!(
            (self, next),
            (Requested, Booting)
                | (Booting, Up)
                | (Up, Integrating)
                | (Integrating, Working)
                | (Working, Disintegrating)
                | (Disintegrating, Disintegrated)
                | (Disintegrating, Down)
                | (Failed, Down)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Requested => "requested",
            MachineState::Booting => "booting",
            MachineState::Up => "up",
            MachineState::Integrating => "integrating",
            MachineState::Working => "working",
            MachineState::Disintegrating => "disintegrating",
            MachineState::Disintegrated => "disintegrated",
            MachineState::Failed => "failed",
            MachineState::Down => "down",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single managed compute unit.
///
/// `id`, `machine_type`, `site`, and `integration` are fixed at
/// creation. `state` changes only through
/// [`MachineRegistry::advance`](crate::MachineRegistry::advance).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub id: MachineId,
    pub machine_type: MachineType,
    pub state: MachineState,
    /// Assigned by the site backend once provisioning is accepted.
    pub site_id: Option<SiteId>,
    /// Logical name of the owning site backend.
    pub site: String,
    /// Logical name of the owning integration backend.
    pub integration: String,
    /// Opaque bookkeeping owned by the backends (IP address, node name,
    /// …). Never interpreted by the core.
    pub backend_attributes: HashMap<String, String>,
    /// Unix timestamp (seconds) of the last transition.
    pub state_changed_at: u64,
}

impl Machine {
    /// Seconds this machine has spent in its current state.
    pub fn seconds_in_state(&self, now: u64) -> u64 {
        now.saturating_sub(self.state_changed_at)
    }
}
