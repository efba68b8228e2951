//! MachineRegistry — the single source of truth for what exists.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use flexgrid_core::MachineId;
use flexgrid_events::{Event, EventBus, EventKind};

use crate::error::{RegistryError, RegistryResult};
use crate::machine::{Machine, MachineState};

/// In-memory table of all known machines, keyed by machine id.
///
/// Owned exclusively by the broker cycle; transitions are the only
/// mutation path. Iteration order is the id order (BTreeMap), which
/// keeps cycle decisions deterministic.
pub struct MachineRegistry {
    machines: BTreeMap<MachineId, Machine>,
    /// Machine types this controller is configured for. `create` refuses
    /// anything else.
    known_types: BTreeSet<String>,
    next_id: u64,
    bus: EventBus,
}

impl MachineRegistry {
    pub fn new(known_types: impl IntoIterator<Item = String>, bus: EventBus) -> Self {
        MachineRegistry {
            machines: BTreeMap::new(),
            known_types: known_types.into_iter().collect(),
            next_id: 1,
            bus,
        }
    }

    /// Insert a new machine in `requested` and return its id.
    pub fn create(
        &mut self,
        machine_type: &str,
        site: &str,
        integration: &str,
    ) -> RegistryResult<MachineId> {
        if !self.known_types.contains(machine_type) {
            return Err(RegistryError::UnknownMachineType(machine_type.to_string()));
        }

        let id = format!("m-{}", self.next_id);
        self.next_id += 1;

        let machine = Machine {
            id: id.clone(),
            machine_type: machine_type.to_string(),
            state: MachineState::Requested,
            site_id: None,
            site: site.to_string(),
            integration: integration.to_string(),
            backend_attributes: HashMap::new(),
            state_changed_at: epoch_secs(),
        };
        self.machines.insert(id.clone(), machine);

        debug!(%id, machine_type, site, "machine created");
        self.bus.publish(&Event::new(
            EventKind::MachineCreated,
            Some(id.clone()),
            format!("type {machine_type} on site {site}"),
        ));
        Ok(id)
    }

    /// Move a machine along the lifecycle graph.
    ///
    /// An edge not in the graph is refused: the state is left unchanged,
    /// a `TransitionRefused` event is published, and the error returned.
    pub fn advance(&mut self, id: &str, next: MachineState) -> RegistryResult<()> {
        let machine = self
            .machines
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let from = machine.state;
        if !from.can_advance_to(next) {
            self.bus.publish(&Event::new(
                EventKind::TransitionRefused,
                Some(id.to_string()),
                format!("{from} -> {next}"),
            ));
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        machine.state = next;
        machine.state_changed_at = epoch_secs();

        debug!(%id, %from, to = %next, "machine advanced");
        self.bus
            .publish(&Event::state_changed(id, from.as_str(), next.as_str()));
        Ok(())
    }

    /// Remove a machine. Permitted only from a terminal state.
    pub fn remove(&mut self, id: &str) -> RegistryResult<Machine> {
        let state = self
            .machines
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?
            .state;

        if !state.is_terminal() {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: state.to_string(),
                to: "removed".to_string(),
            });
        }

        let machine = self.machines.remove(id).expect("checked above");
        debug!(%id, %state, "machine removed");
        self.bus.publish(&Event::new(
            EventKind::MachineRemoved,
            Some(id.to_string()),
            format!("removed from {state}"),
        ));
        Ok(machine)
    }

    /// Record the site-assigned id after provisioning was accepted.
    ///
    /// Refuses a site id already held by another machine of the same
    /// site backend.
    pub fn set_site_id(&mut self, id: &str, site_id: &str) -> RegistryResult<()> {
        let site = self
            .machines
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?
            .site
            .clone();

        if self
            .machines
            .values()
            .any(|m| m.id != id && m.site == site && m.site_id.as_deref() == Some(site_id))
        {
            return Err(RegistryError::DuplicateSiteId {
                site,
                site_id: site_id.to_string(),
            });
        }

        let machine = self.machines.get_mut(id).expect("checked above");
        machine.site_id = Some(site_id.to_string());
        Ok(())
    }

    /// Backend-owned bookkeeping; never interpreted by the core.
    pub fn set_backend_attribute(&mut self, id: &str, key: &str, value: &str) -> RegistryResult<()> {
        let machine = self
            .machines
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        machine
            .backend_attributes
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Machine> {
        self.machines.get(id)
    }

    /// Lazy, restartable view of machines matching `predicate`.
    pub fn query<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a Machine>
    where
        P: Fn(&Machine) -> bool + 'a,
    {
        self.machines.values().filter(move |m| predicate(m))
    }

    pub fn machines_of_type<'a>(&'a self, machine_type: &'a str) -> impl Iterator<Item = &'a Machine> {
        self.query(move |m| m.machine_type == machine_type)
    }

    pub fn find_by_site_id(&self, site: &str, site_id: &str) -> Option<&Machine> {
        self.machines
            .values()
            .find(|m| m.site == site && m.site_id.as_deref() == Some(site_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Load machines from a snapshot. Only valid before the first cycle;
    /// existing entries are replaced wholesale.
    pub fn restore(&mut self, machines: Vec<Machine>) {
        self.machines.clear();
        let mut max_seen = 0;
        for machine in machines {
            if let Some(n) = machine
                .id
                .strip_prefix("m-")
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_seen = max_seen.max(n);
            }
            self.machines.insert(machine.id.clone(), machine);
        }
        self.next_id = max_seen + 1;
        debug!(count = self.machines.len(), "registry restored from snapshot");
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
