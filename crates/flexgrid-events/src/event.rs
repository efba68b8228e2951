//! Event record types.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use flexgrid_core::MachineId;

/// Category of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A machine was inserted into the registry.
    MachineCreated,
    /// A machine moved along the lifecycle graph.
    StateChanged,
    /// A terminal machine was removed from the registry.
    MachineRemoved,
    /// An illegal transition was requested and refused.
    TransitionRefused,
    /// A capability failed or timed out; its machines kept stale state.
    CapabilityDegraded,
    /// A site backend rejected a provisioning request.
    ProvisionRejected,
    /// An integration backend rejected a registration.
    RegisterFailed,
    /// An integration backend failed to deregister a draining machine.
    DeregisterFailed,
    /// A site backend failed to terminate a machine.
    TerminateFailed,
    /// A machine exceeded its per-state threshold and was forced to failed.
    TimeoutExpired,
}

/// Immutable notification record. Append-only, broadcast-only; carries
/// no control-flow meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub machine_id: Option<MachineId>,
    /// Human-readable detail for operators (log sinks, plotting).
    pub detail: String,
    /// Unix timestamp (seconds) of publication.
    pub timestamp: u64,
}

impl Event {
    pub fn new(kind: EventKind, machine_id: Option<MachineId>, detail: impl Into<String>) -> Self {
        Event {
            kind,
            machine_id,
            detail: detail.into(),
            timestamp: epoch_secs(),
        }
    }

    /// Event for a successful lifecycle transition.
    pub fn state_changed(id: &str, from: &str, to: &str) -> Self {
        Event::new(
            EventKind::StateChanged,
            Some(id.to_string()),
            format!("{from} -> {to}"),
        )
    }

    /// Diagnostic event for a capability that failed to respond this cycle.
    pub fn capability_degraded(capability: &str, detail: &str) -> Self {
        Event::new(
            EventKind::CapabilityDegraded,
            None,
            format!("{capability}: {detail}"),
        )
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_changed_formats_detail() {
        let event = Event::state_changed("m-1", "requested", "booting");
        assert_eq!(event.kind, EventKind::StateChanged);
        assert_eq!(event.machine_id.as_deref(), Some("m-1"));
        assert_eq!(event.detail, "requested -> booting");
    }

    #[test]
    fn events_serialize_to_json() {
        let event = Event::capability_degraded("cloud-a", "request timed out");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("capability_degraded"));
        assert!(json.contains("cloud-a"));
    }
}
