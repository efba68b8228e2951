//! Broker — one reconciliation cycle over demand, supply, and lifecycle.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use flexgrid_capability::{
    BatchStatus, CapabilityError, IntegrationCapability, RequirementCapability, SiteCapability,
    SiteStatus,
};
use flexgrid_core::{ControllerConfig, MachineId, MachineTypeConfig};
use flexgrid_events::{Event, EventBus, EventKind};
use flexgrid_registry::{Machine, MachineRegistry, MachineState, RegistrySnapshot};

use crate::error::{BrokerError, BrokerResult};

/// The capability instances for one controller run, explicitly
/// constructed and passed in — no global registries, which keeps fake
/// backends trivial to wire in tests.
#[derive(Default)]
pub struct CapabilitySet {
    requirements: BTreeMap<String, Arc<dyn RequirementCapability>>,
    sites: BTreeMap<String, Arc<dyn SiteCapability>>,
    integrations: BTreeMap<String, Arc<dyn IntegrationCapability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        CapabilitySet::default()
    }

    pub fn add_requirement(&mut self, capability: Arc<dyn RequirementCapability>) {
        self.requirements
            .insert(capability.name().to_string(), capability);
    }

    pub fn add_site(&mut self, capability: Arc<dyn SiteCapability>) {
        self.sites.insert(capability.name().to_string(), capability);
    }

    pub fn add_integration(&mut self, capability: Arc<dyn IntegrationCapability>) {
        self.integrations
            .insert(capability.name().to_string(), capability);
    }
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Machines whose provisioning request was accepted.
    pub provisioned: usize,
    /// Machines torn down and removed from the registry.
    pub retired: usize,
    /// Machines forced to failed by the timeout sweep.
    pub timed_out: usize,
    /// Capability calls that failed or timed out.
    pub degraded: usize,
}

/// The reconciliation engine. Owns the registry; each `run_cycle` call
/// is independent — everything it needs is re-derived from the registry
/// and fresh capability responses.
pub struct Broker {
    config: ControllerConfig,
    capabilities: CapabilitySet,
    registry: MachineRegistry,
    bus: EventBus,
    snapshot: Option<RegistrySnapshot>,
}

impl Broker {
    /// Build a broker, validating that every machine type's backend
    /// references resolve against the capability set.
    pub fn new(
        config: ControllerConfig,
        capabilities: CapabilitySet,
        bus: EventBus,
    ) -> BrokerResult<Self> {
        for (machine_type, type_config) in &config.machine_types {
            if !capabilities.sites.contains_key(&type_config.site) {
                return Err(BrokerError::UnknownSite {
                    machine_type: machine_type.clone(),
                    site: type_config.site.clone(),
                });
            }
            if !capabilities.integrations.contains_key(&type_config.integration) {
                return Err(BrokerError::UnknownIntegration {
                    machine_type: machine_type.clone(),
                    integration: type_config.integration.clone(),
                });
            }
            for requirement in &type_config.requirements {
                if !capabilities.requirements.contains_key(requirement) {
                    return Err(BrokerError::UnknownRequirement {
                        machine_type: machine_type.clone(),
                        requirement: requirement.clone(),
                    });
                }
            }
        }

        let registry =
            MachineRegistry::new(config.machine_types.keys().cloned(), bus.clone());
        Ok(Broker {
            config,
            capabilities,
            registry,
            bus,
            snapshot: None,
        })
    }

    /// Attach snapshot persistence. Loads the stored machines into the
    /// registry immediately — call before the first cycle.
    pub fn with_snapshot(mut self, snapshot: RegistrySnapshot) -> BrokerResult<Self> {
        let machines = snapshot.load()?;
        if !machines.is_empty() {
            info!(count = machines.len(), "restoring registry from snapshot");
        }
        self.registry.restore(machines);
        self.snapshot = Some(snapshot);
        Ok(self)
    }

    /// Read-only view of the machine table.
    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    /// One reconciliation cycle.
    pub async fn run_cycle(&mut self) -> BrokerResult<CycleReport> {
        let mut report = CycleReport::default();

        let batch = self.refresh(&mut report).await;
        self.continue_teardowns(&mut report).await;

        let type_names: Vec<String> = self.config.machine_types.keys().cloned().collect();
        for machine_type in type_names {
            let type_config = self.config.machine_types[&machine_type].clone();
            let demand = self
                .aggregate_demand(&machine_type, &type_config, &mut report)
                .await;
            let desired = demand.max(0.0).ceil() as usize;
            let supply = self.count_supply(&machine_type);
            debug!(machine_type = %machine_type, demand, desired, supply, "delta decision");

            if desired > supply {
                self.scale_up(&machine_type, &type_config, desired - supply, &mut report)
                    .await?;
            } else if desired < supply {
                self.scale_down(
                    &machine_type,
                    supply - desired,
                    desired,
                    &batch,
                    &mut report,
                )
                .await;
            }
        }

        self.timeout_sweep(&mut report).await;

        if let Some(ref snapshot) = self.snapshot {
            snapshot.save(self.registry.iter())?;
        }

        debug!(?report, "reconciliation cycle complete");
        Ok(report)
    }

    // ── Step 1: refresh ─────────────────────────────────────────────

    /// Pull fresh site and batch status into the registry. Returns the
    /// batch status seen this cycle, used by scale-down selection.
    async fn refresh(&mut self, report: &mut CycleReport) -> BTreeMap<MachineId, BatchStatus> {
        self.refresh_sites(report).await;
        self.register_booted(report).await;
        self.refresh_batch(report).await
    }

    /// Ask each site backend for the status of its provisioned
    /// machines, concurrently, then apply the answers serially.
    async fn refresh_sites(&mut self, report: &mut CycleReport) {
        let limit = self.call_timeout();
        let targets: Vec<(MachineId, String, String)> = self
            .registry
            .iter()
            .filter(|m| !m.state.is_terminal())
            .filter_map(|m| {
                m.site_id
                    .as_ref()
                    .map(|site_id| (m.id.clone(), m.site.clone(), site_id.clone()))
            })
            .collect();

        let mut join = JoinSet::new();
        for (machine_id, site_name, site_id) in targets {
            let Some(site) = self.capabilities.sites.get(&site_name).cloned() else {
                continue;
            };
            join.spawn(async move {
                let status = bounded(limit, site.query_status(&site_id)).await;
                (machine_id, site_name, status)
            });
        }

        let mut degraded: BTreeSet<String> = BTreeSet::new();
        let mut statuses: Vec<(MachineId, SiteStatus)> = Vec::new();
        while let Some(joined) = join.join_next().await {
            let Ok((machine_id, site_name, status)) = joined else {
                continue;
            };
            match status {
                Ok(status) => statuses.push((machine_id, status)),
                Err(error) => {
                    if degraded.insert(site_name.clone()) {
                        self.report_degraded(&site_name, &error, report);
                    }
                }
            }
        }
        // Apply in id order so decisions don't depend on join order.
        statuses.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, status) in statuses {
            let Some(state) = self.registry.get(&id).map(|m| m.state) else {
                continue;
            };
            match status {
                SiteStatus::Running if state == MachineState::Booting => {
                    self.advance_logged(&id, MachineState::Up);
                }
                SiteStatus::Error
                    if !state.is_terminal() && state != MachineState::Failed =>
                {
                    self.advance_logged(&id, MachineState::Failed);
                }
                SiteStatus::Terminated => match state {
                    MachineState::Disintegrating => {
                        // Teardown confirmed by the backend, but the
                        // batch system may still reference the worker.
                        self.complete_teardown(&id, report).await;
                    }
                    s if !s.is_terminal() && s != MachineState::Failed => {
                        // Vanished underneath us.
                        self.advance_logged(&id, MachineState::Failed);
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    /// Register machines the site reports up with their batch system.
    async fn register_booted(&mut self, report: &mut CycleReport) {
        let limit = self.call_timeout();
        let booted: Vec<_> = self
            .registry
            .query(|m| m.state == MachineState::Up)
            .cloned()
            .collect();

        let mut join = JoinSet::new();
        for machine in booted {
            let Some(integration) = self
                .capabilities
                .integrations
                .get(&machine.integration)
                .cloned()
            else {
                continue;
            };
            join.spawn(async move {
                let result = bounded(limit, integration.register(&machine)).await;
                (machine.id, machine.integration, result)
            });
        }

        let mut degraded: BTreeSet<String> = BTreeSet::new();
        let mut outcomes: Vec<(MachineId, Result<(), CapabilityError>)> = Vec::new();
        while let Some(joined) = join.join_next().await {
            let Ok((machine_id, integration_name, result)) = joined else {
                continue;
            };
            match result {
                Err(error @ CapabilityError::Unavailable(_)) => {
                    if degraded.insert(integration_name.clone()) {
                        self.report_degraded(&integration_name, &error, report);
                    }
                }
                other => outcomes.push((machine_id, other)),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, result) in outcomes {
            match result {
                Ok(()) => self.advance_logged(&id, MachineState::Integrating),
                Err(error) => {
                    self.bus.publish(&Event::new(
                        EventKind::RegisterFailed,
                        Some(id.clone()),
                        error.to_string(),
                    ));
                    self.advance_logged(&id, MachineState::Failed);
                }
            }
        }
    }

    /// Query batch status for integrated machines.
    async fn refresh_batch(
        &mut self,
        report: &mut CycleReport,
    ) -> BTreeMap<MachineId, BatchStatus> {
        let limit = self.call_timeout();
        let integrated: Vec<_> = self
            .registry
            .query(|m| {
                matches!(
                    m.state,
                    MachineState::Integrating | MachineState::Working
                )
            })
            .cloned()
            .collect();

        let mut join = JoinSet::new();
        for machine in integrated {
            let Some(integration) = self
                .capabilities
                .integrations
                .get(&machine.integration)
                .cloned()
            else {
                continue;
            };
            join.spawn(async move {
                let status = bounded(limit, integration.query_status(&machine)).await;
                (machine.id, machine.integration, status)
            });
        }

        let mut degraded: BTreeSet<String> = BTreeSet::new();
        let mut statuses: Vec<(MachineId, BatchStatus)> = Vec::new();
        while let Some(joined) = join.join_next().await {
            let Ok((machine_id, integration_name, status)) = joined else {
                continue;
            };
            match status {
                Ok(status) => statuses.push((machine_id, status)),
                Err(error) => {
                    if degraded.insert(integration_name.clone()) {
                        self.report_degraded(&integration_name, &error, report);
                    }
                }
            }
        }
        statuses.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batch = BTreeMap::new();
        for (id, status) in statuses {
            let state = self.registry.get(&id).map(|m| m.state);
            if state == Some(MachineState::Integrating)
                && matches!(status, BatchStatus::Idle { .. } | BatchStatus::Working)
            {
                self.advance_logged(&id, MachineState::Working);
            }
            batch.insert(id, status);
        }
        batch
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Retry teardown of machines left disintegrating by an earlier
    /// cycle (failed deregistration, unreachable site, crash).
    async fn continue_teardowns(&mut self, report: &mut CycleReport) {
        let pending: Vec<MachineId> = self
            .registry
            .query(|m| m.state == MachineState::Disintegrating)
            .map(|m| m.id.clone())
            .collect();
        for id in pending {
            self.teardown(&id, report).await;
        }
    }

    /// Drive one machine out of existence: deregister from its batch
    /// system, then terminate at its site, then drop it from the
    /// registry. Termination is never issued before deregistration
    /// succeeded, so the batch system cannot reference a vanished
    /// worker. Returns true once the machine is gone.
    async fn teardown(&mut self, id: &str, report: &mut CycleReport) -> bool {
        let Some(machine) = self.registry.get(id).cloned() else {
            return false;
        };

        if !self.try_deregister(&machine).await {
            // Still registered; retry next cycle before terminating.
            return false;
        }

        if let Some(site_id) = machine.site_id.as_deref()
            && let Some(site) = self.capabilities.sites.get(&machine.site).cloned()
        {
            let limit = self.call_timeout();
            match bounded(limit, site.terminate(site_id)).await {
                Ok(()) => {}
                Err(error @ CapabilityError::Unavailable(_)) => {
                    self.report_degraded(&machine.site, &error, report);
                    return false;
                }
                Err(error) => {
                    self.bus.publish(&Event::new(
                        EventKind::TerminateFailed,
                        Some(machine.id.clone()),
                        error.to_string(),
                    ));
                    if machine.state != MachineState::Failed {
                        self.advance_logged(id, MachineState::Failed);
                    }
                    return false;
                }
            }
        }

        self.finish_removal(id, machine.state, report);
        true
    }

    /// Finish teardown of a machine the site already reports gone:
    /// deregister, then drop it. No terminate call is issued, but the
    /// machine stays in the registry until deregistration succeeds.
    async fn complete_teardown(&mut self, id: &str, report: &mut CycleReport) -> bool {
        let Some(machine) = self.registry.get(id).cloned() else {
            return false;
        };

        if !self.try_deregister(&machine).await {
            return false;
        }

        self.finish_removal(id, machine.state, report);
        true
    }

    async fn try_deregister(&mut self, machine: &Machine) -> bool {
        let Some(integration) = self
            .capabilities
            .integrations
            .get(&machine.integration)
            .cloned()
        else {
            return true;
        };
        let limit = self.call_timeout();
        match bounded(limit, integration.deregister(machine)).await {
            Ok(()) => true,
            Err(error) => {
                self.bus.publish(&Event::new(
                    EventKind::DeregisterFailed,
                    Some(machine.id.clone()),
                    error.to_string(),
                ));
                false
            }
        }
    }

    fn finish_removal(&mut self, id: &str, state: MachineState, report: &mut CycleReport) {
        let terminal = if state == MachineState::Failed {
            MachineState::Down
        } else {
            MachineState::Disintegrated
        };
        self.advance_logged(id, terminal);
        self.remove_logged(id);
        report.retired += 1;
    }

    // ── Step 2: demand ──────────────────────────────────────────────

    async fn aggregate_demand(
        &self,
        machine_type: &str,
        type_config: &MachineTypeConfig,
        report: &mut CycleReport,
    ) -> f64 {
        let limit = self.call_timeout();
        let mut total = 0.0;
        for name in &type_config.requirements {
            let Some(requirement) = self.capabilities.requirements.get(name).cloned() else {
                continue;
            };
            match bounded(limit, requirement.get_demand(machine_type)).await {
                Ok(value) => total += value,
                // Fail-open toward "no additional requirement".
                Err(error) => self.report_degraded(name, &error, report),
            }
        }
        total
    }

    // ── Step 3: supply ──────────────────────────────────────────────

    /// Machines counted toward capacity: everything except terminals
    /// and machines already being torn down.
    fn count_supply(&self, machine_type: &str) -> usize {
        self.registry
            .machines_of_type(machine_type)
            .filter(|m| {
                !matches!(
                    m.state,
                    MachineState::Disintegrating
                        | MachineState::Disintegrated
                        | MachineState::Down
                )
            })
            .count()
    }

    // ── Step 4: delta ───────────────────────────────────────────────

    async fn scale_up(
        &mut self,
        machine_type: &str,
        type_config: &MachineTypeConfig,
        shortfall: usize,
        report: &mut CycleReport,
    ) -> BrokerResult<()> {
        let in_flight = self
            .registry
            .machines_of_type(machine_type)
            .filter(|m| matches!(m.state, MachineState::Requested | MachineState::Booting))
            .count();
        let headroom = (type_config.max_in_flight as usize).saturating_sub(in_flight);
        let to_create = shortfall.min(headroom);
        if to_create == 0 {
            return Ok(());
        }
        info!(machine_type = %machine_type, shortfall, to_create, in_flight, "scaling up");

        let Some(site) = self.capabilities.sites.get(&type_config.site).cloned() else {
            return Ok(());
        };
        let limit = self.call_timeout();

        for _ in 0..to_create {
            let id = self
                .registry
                .create(machine_type, &type_config.site, &type_config.integration)?;
            match bounded(limit, site.provision(machine_type)).await {
                Ok(site_id) => {
                    if let Err(error) = self.registry.set_site_id(&id, &site_id) {
                        warn!(%id, error = %error, "site backend returned conflicting site id");
                        self.advance_logged(&id, MachineState::Failed);
                        continue;
                    }
                    self.advance_logged(&id, MachineState::Booting);
                    report.provisioned += 1;
                }
                Err(error @ CapabilityError::Unavailable(_)) => {
                    // The request may still land remotely; the machine
                    // stays requested and is reconciled or timed out
                    // later. No point hammering a degraded site.
                    self.report_degraded(&type_config.site, &error, report);
                    break;
                }
                Err(error) => {
                    self.bus.publish(&Event::new(
                        EventKind::ProvisionRejected,
                        Some(id.clone()),
                        error.to_string(),
                    ));
                    self.advance_logged(&id, MachineState::Failed);
                }
            }
        }
        Ok(())
    }

    async fn scale_down(
        &mut self,
        machine_type: &str,
        excess: usize,
        desired: usize,
        batch: &BTreeMap<MachineId, BatchStatus>,
        report: &mut CycleReport,
    ) {
        let mut failed: Vec<MachineId> = Vec::new();
        let mut idle: Vec<(u64, MachineId)> = Vec::new();
        let mut pending: Vec<(u64, MachineId)> = Vec::new();
        let mut busy: Vec<MachineId> = Vec::new();

        for machine in self.registry.machines_of_type(machine_type) {
            match machine.state {
                MachineState::Disintegrating
                | MachineState::Disintegrated
                | MachineState::Down => continue,
                MachineState::Failed => failed.push(machine.id.clone()),
                MachineState::Working => match batch.get(&machine.id) {
                    Some(BatchStatus::Idle { idle_since }) => {
                        idle.push((*idle_since, machine.id.clone()))
                    }
                    // Working, draining, or unknown count as occupied.
                    // A draining worker is already leaving the queue and
                    // must not be selected a second time.
                    _ => busy.push(machine.id.clone()),
                },
                // Not yet integrated: requested, booting, up, integrating.
                _ => pending.push((machine.state_changed_at, machine.id.clone())),
            }
        }
        idle.sort(); // longest idle first
        pending.sort(); // oldest first
        let non_working = failed.len() + idle.len() + pending.len();

        let mut victims: Vec<MachineId> = Vec::with_capacity(excess);
        victims.extend(failed);
        victims.extend(idle.into_iter().map(|(_, id)| id));
        victims.extend(pending.into_iter().map(|(_, id)| id));
        victims.truncate(excess);

        // Machines with running jobs are only retired when nothing else
        // is left and the target is still below the non-working count.
        if victims.len() < excess && desired < non_working {
            for id in busy {
                if victims.len() == excess {
                    break;
                }
                victims.push(id);
            }
        }
        info!(machine_type = %machine_type, excess, selected = victims.len(), "scaling down");

        for id in victims {
            let Some(state) = self.registry.get(&id).map(|m| m.state) else {
                continue;
            };
            match state {
                MachineState::Working => {
                    self.advance_logged(&id, MachineState::Disintegrating);
                    self.teardown(&id, report).await;
                }
                MachineState::Failed => {
                    self.teardown(&id, report).await;
                }
                _ => {
                    // Never integrated; forced retirement goes through
                    // failed so the lifecycle graph stays honest.
                    self.advance_logged(&id, MachineState::Failed);
                    self.teardown(&id, report).await;
                }
            }
        }
    }

    // ── Step 5: timeout sweep ───────────────────────────────────────

    async fn timeout_sweep(&mut self, report: &mut CycleReport) {
        let now = epoch_secs();
        let stuck: Vec<(MachineId, MachineState, String, u64)> = self
            .registry
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    m.state,
                    m.machine_type.clone(),
                    m.seconds_in_state(now),
                )
            })
            .collect();

        for (id, state, machine_type, elapsed) in stuck {
            let Some(type_config) = self.config.machine_types.get(&machine_type) else {
                continue;
            };
            let timeouts = &type_config.timeouts;
            let threshold = match state {
                MachineState::Requested => timeouts.requested_secs,
                MachineState::Booting => timeouts.booting_secs,
                MachineState::Up => timeouts.up_secs,
                MachineState::Integrating => timeouts.integrating_secs,
                MachineState::Disintegrating => timeouts.disintegrating_secs,
                MachineState::Failed => timeouts.failed_secs,
                MachineState::Working
                | MachineState::Disintegrated
                | MachineState::Down => continue,
            };
            if elapsed <= threshold {
                continue;
            }

            if state == MachineState::Failed {
                // Lingered in failed long enough; force it down and out.
                self.teardown(&id, report).await;
            } else {
                self.bus.publish(&Event::new(
                    EventKind::TimeoutExpired,
                    Some(id.clone()),
                    format!("stuck in {state} for {elapsed}s (threshold {threshold}s)"),
                ));
                self.advance_logged(&id, MachineState::Failed);
                report.timed_out += 1;
            }
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.capability_timeout_secs)
    }

    fn advance_logged(&mut self, id: &str, next: MachineState) {
        if let Err(error) = self.registry.advance(id, next) {
            warn!(%id, error = %error, "transition refused");
        }
    }

    fn remove_logged(&mut self, id: &str) {
        if let Err(error) = self.registry.remove(id) {
            warn!(%id, error = %error, "removal refused");
        }
    }

    fn report_degraded(
        &self,
        capability: &str,
        error: &CapabilityError,
        report: &mut CycleReport,
    ) {
        warn!(capability, error = %error, "capability degraded; keeping stale state this cycle");
        self.bus
            .publish(&Event::capability_degraded(capability, &error.to_string()));
        report.degraded += 1;
    }
}

/// Bound a capability call by the per-call timeout; an overrun is a
/// transient unavailability.
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, CapabilityError>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Unavailable(format!(
            "no response within {}s",
            limit.as_secs()
        ))),
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
    use std::collections::HashMap;
    use std::sync::Mutex;

    use flexgrid_capability::sim::CallJournal;
    use flexgrid_capability::{SimIntegration, SimSite, StaticRequirement};
    use flexgrid_core::{MachineTypeConfig, StateTimeouts};
    use flexgrid_registry::Machine;

    const TYPE: &str = "cloud-small";

    fn test_config(max_in_flight: u32) -> ControllerConfig {
        ControllerConfig {
            cycle_interval_secs: 1,
            capability_timeout_secs: 1,
            snapshot_path: None,
            machine_types: BTreeMap::from([(
                TYPE.to_string(),
                MachineTypeConfig {
                    site: "site-a".to_string(),
                    integration: "condor".to_string(),
                    requirements: vec!["condor".to_string()],
                    max_in_flight,
                    timeouts: StateTimeouts::default(),
                },
            )]),
            sites: BTreeMap::new(),
            integrations: BTreeMap::new(),
            requirements: BTreeMap::new(),
        }
    }

    struct Harness {
        broker: Broker,
        site: Arc<SimSite>,
        integration: Arc<SimIntegration>,
        requirement: Arc<StaticRequirement>,
        events: Arc<Mutex<Vec<EventKind>>>,
        journal: CallJournal,
    }

    fn harness(demand: f64) -> Harness {
        harness_with(test_config(10), demand, Vec::new())
    }

    fn harness_with(
        config: ControllerConfig,
        demand: f64,
        machines: Vec<Machine>,
    ) -> Harness {
        let journal: CallJournal = Arc::new(Mutex::new(Vec::new()));
        let site = Arc::new(SimSite::new("site-a").with_journal(journal.clone()));
        let integration =
            Arc::new(SimIntegration::new("condor").with_journal(journal.clone()));
        let requirement = Arc::new(StaticRequirement::new(
            "condor",
            BTreeMap::from([(TYPE.to_string(), demand)]),
        ));

        let mut capabilities = CapabilitySet::new();
        capabilities.add_site(site.clone());
        capabilities.add_integration(integration.clone());
        capabilities.add_requirement(requirement.clone());

        let bus = EventBus::default();
        let events: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(
            None,
            Box::new(move |event| {
                sink.lock().unwrap().push(event.kind);
                Ok(())
            }),
        );

        let mut broker = Broker::new(config, capabilities, bus).unwrap();
        if !machines.is_empty() {
            let snapshot = RegistrySnapshot::open_in_memory().unwrap();
            snapshot.save(machines.iter()).unwrap();
            broker = broker.with_snapshot(snapshot).unwrap();
        }

        Harness {
            broker,
            site,
            integration,
            requirement,
            events,
            journal,
        }
    }

    fn machine(id: &str, state: MachineState, site_id: Option<&str>, changed_at: u64) -> Machine {
        Machine {
            id: id.to_string(),
            machine_type: TYPE.to_string(),
            state,
            site_id: site_id.map(str::to_string),
            site: "site-a".to_string(),
            integration: "condor".to_string(),
            backend_attributes: HashMap::new(),
            state_changed_at: changed_at,
        }
    }

    fn states(broker: &Broker) -> Vec<(MachineId, MachineState)> {
        broker
            .registry()
            .iter()
            .map(|m| (m.id.clone(), m.state))
            .collect()
    }

    fn event_kinds(harness: &Harness) -> Vec<EventKind> {
        harness.events.lock().unwrap().clone()
    }

    fn now() -> u64 {
        epoch_secs()
    }

    #[tokio::test(start_paused = true)]
    async fn shortfall_provisions_exactly_the_delta() {
        let mut h = harness(5.0);
        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.provisioned, 5);
        assert_eq!(h.site.provision_calls(), 5);
        assert_eq!(h.broker.registry().len(), 5);
        assert!(h
            .broker
            .registry()
            .iter()
            .all(|m| m.state == MachineState::Booting && m.site_id.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn max_in_flight_caps_provisioning() {
        let mut h = harness_with(test_config(2), 5.0, Vec::new());
        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.provisioned, 2);
        assert_eq!(h.site.provision_calls(), 2);
        assert_eq!(h.broker.registry().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn balanced_cycle_changes_nothing() {
        let mut h = harness(2.0);
        h.broker.run_cycle().await.unwrap();
        // Second cycle: 2 machines exist, demand 2, nothing to do.
        let before = states(&h.broker);
        let calls = h.site.provision_calls();

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(h.site.provision_calls(), calls);
        assert_eq!(report.provisioned, 0);
        assert_eq!(report.retired, 0);
        // Machines advanced through refresh, but the set is unchanged.
        assert_eq!(
            before.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            states(&h.broker).iter().map(|(id, _)| id).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn identical_worlds_produce_identical_decisions() {
        let mut a = harness(3.0);
        let mut b = harness(3.0);

        a.broker.run_cycle().await.unwrap();
        b.broker.run_cycle().await.unwrap();

        assert_eq!(states(&a.broker), states(&b.broker));
        assert_eq!(event_kinds(&a), event_kinds(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn machine_reaches_working_in_two_cycles() {
        let mut h = harness(1.0);

        h.broker.run_cycle().await.unwrap();
        assert_eq!(states(&h.broker), vec![("m-1".to_string(), MachineState::Booting)]);

        // Site reports running, registration succeeds, batch reports
        // idle: booting -> up -> integrating -> working in one refresh.
        h.broker.run_cycle().await.unwrap();
        assert_eq!(states(&h.broker), vec![("m-1".to_string(), MachineState::Working)]);
        assert!(h.integration.is_registered("m-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_prefers_longest_idle() {
        let t = now();
        let machines = vec![
            machine("m-1", MachineState::Working, Some("vm-1"), t),
            machine("m-2", MachineState::Working, Some("vm-2"), t),
            machine("m-3", MachineState::Working, Some("vm-3"), t),
            machine("m-4", MachineState::Working, Some("vm-4"), t),
            machine("m-5", MachineState::Working, Some("vm-5"), t),
        ];
        let mut h = harness_with(test_config(10), 2.0, machines);
        for vm in ["vm-1", "vm-2", "vm-3", "vm-4", "vm-5"] {
            h.site.set_status(vm, SiteStatus::Running);
        }
        // m-1..m-3 idle with distinct ages; m-4, m-5 have running jobs.
        h.integration.set_status("m-1", BatchStatus::Idle { idle_since: 100 });
        h.integration.set_status("m-2", BatchStatus::Idle { idle_since: 300 });
        h.integration.set_status("m-3", BatchStatus::Idle { idle_since: 200 });
        h.integration.set_status("m-4", BatchStatus::Working);
        h.integration.set_status("m-5", BatchStatus::Working);

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.retired, 3);
        let remaining: Vec<MachineId> =
            h.broker.registry().iter().map(|m| m.id.clone()).collect();
        assert_eq!(remaining, vec!["m-4".to_string(), "m-5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_machines_survive_zero_demand_when_protected() {
        let t = now();
        let machines = vec![
            machine("m-1", MachineState::Working, Some("vm-1"), t),
            machine("m-2", MachineState::Working, Some("vm-2"), t),
        ];
        let mut h = harness_with(test_config(10), 0.0, machines);
        h.site.set_status("vm-1", SiteStatus::Running);
        h.site.set_status("vm-2", SiteStatus::Running);
        h.integration.set_status("m-1", BatchStatus::Working);
        h.integration.set_status("m-2", BatchStatus::Working);

        let report = h.broker.run_cycle().await.unwrap();

        // No idle or failed candidates and no non-working surplus, so
        // machines with running jobs are left alone.
        assert_eq!(report.retired, 0);
        assert_eq!(h.broker.registry().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_deregisters_before_terminating() {
        let t = now();
        let machines = vec![machine("m-1", MachineState::Working, Some("vm-1"), t)];
        let mut h = harness_with(test_config(10), 0.0, machines);
        h.site.set_status("vm-1", SiteStatus::Running);
        h.integration
            .set_status("m-1", BatchStatus::Idle { idle_since: 100 });

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.retired, 1);
        assert!(h.broker.registry().is_empty());
        let entries = h.journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["deregister m-1", "terminate vm-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn externally_terminated_teardown_still_deregisters() {
        // Left disintegrating by an earlier cycle and torn down behind
        // our back; the worker is still registered in the batch system.
        let t = now();
        let machines = vec![machine("m-1", MachineState::Disintegrating, Some("vm-1"), t)];
        let mut h = harness_with(test_config(10), 0.0, machines);
        h.site.set_status("vm-1", SiteStatus::Terminated);
        h.integration
            .set_status("m-1", BatchStatus::Idle { idle_since: 100 });

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.retired, 1);
        assert!(h.broker.registry().is_empty());
        assert!(!h.integration.is_registered("m-1"));
        // Deregistered, but no terminate for a machine already gone.
        let entries = h.journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["deregister m-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_rejection_fails_the_machine() {
        let t = now();
        let machines = vec![machine("m-1", MachineState::Working, Some("vm-1"), t)];
        let mut h = harness_with(test_config(10), 0.0, machines);
        h.site.set_status("vm-1", SiteStatus::Running);
        h.site.set_fail_terminate(true);
        h.integration
            .set_status("m-1", BatchStatus::Idle { idle_since: 100 });

        let report = h.broker.run_cycle().await.unwrap();

        // Deregistered, but the rejected terminate parks it in failed
        // instead of silently dropping it.
        assert_eq!(report.retired, 0);
        assert_eq!(
            h.broker.registry().get("m-1").unwrap().state,
            MachineState::Failed
        );
        assert!(event_kinds(&h).contains(&EventKind::TerminateFailed));
        let entries = h.journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["deregister m-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_machines_are_not_retirement_candidates() {
        let t = now();
        let machines = vec![
            machine("m-1", MachineState::Working, Some("vm-1"), t),
            machine("m-2", MachineState::Working, Some("vm-2"), t),
        ];
        let mut h = harness_with(test_config(10), 1.0, machines);
        h.site.set_status("vm-1", SiteStatus::Running);
        h.site.set_status("vm-2", SiteStatus::Running);
        h.integration.set_status("m-1", BatchStatus::Draining);
        h.integration
            .set_status("m-2", BatchStatus::Idle { idle_since: 100 });

        let report = h.broker.run_cycle().await.unwrap();

        // The idle worker goes; the draining one is treated as occupied.
        assert_eq!(report.retired, 1);
        let remaining: Vec<MachineId> =
            h.broker.registry().iter().map(|m| m.id.clone()).collect();
        assert_eq!(remaining, vec!["m-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deregistration_blocks_termination() {
        let t = now();
        let machines = vec![machine("m-1", MachineState::Working, Some("vm-1"), t)];
        let mut h = harness_with(test_config(10), 0.0, machines);
        h.site.set_status("vm-1", SiteStatus::Running);
        h.integration
            .set_status("m-1", BatchStatus::Idle { idle_since: 100 });
        h.integration.set_fail_deregister(true);

        h.broker.run_cycle().await.unwrap();

        // Stuck mid-teardown, never terminated.
        assert_eq!(
            h.broker.registry().get("m-1").unwrap().state,
            MachineState::Disintegrating
        );
        assert!(event_kinds(&h).contains(&EventKind::DeregisterFailed));
        assert!(!h
            .journal
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("terminate")));

        // Backend recovers; the next cycle completes the teardown.
        h.integration.set_fail_deregister(false);
        let report = h.broker.run_cycle().await.unwrap();
        assert_eq!(report.retired, 1);
        assert!(h.broker.registry().is_empty());
        let entries = h.journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["deregister m-1", "terminate vm-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_site_degrades_without_state_changes() {
        let mut h = harness(1.0);
        h.broker.run_cycle().await.unwrap();
        let before = states(&h.broker);

        h.site.set_unreachable(true);
        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(states(&h.broker), before);
        assert!(report.degraded >= 1);
        assert!(event_kinds(&h).contains(&EventKind::CapabilityDegraded));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_requirement_contributes_zero_demand() {
        let mut h = harness(5.0);
        h.requirement.set_unavailable(true);

        let report = h.broker.run_cycle().await.unwrap();

        assert!(h.broker.registry().is_empty());
        assert_eq!(h.site.provision_calls(), 0);
        assert!(report.degraded >= 1);
        assert!(event_kinds(&h).contains(&EventKind::CapabilityDegraded));
    }

    #[tokio::test(start_paused = true)]
    async fn provision_rejection_fails_the_machine() {
        let mut h = harness(2.0);
        h.site.set_fail_provision(true);

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.provisioned, 0);
        assert_eq!(h.broker.registry().len(), 2);
        assert!(h
            .broker
            .registry()
            .iter()
            .all(|m| m.state == MachineState::Failed));
        assert_eq!(
            event_kinds(&h)
                .iter()
                .filter(|k| **k == EventKind::ProvisionRejected)
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn registration_failure_fails_the_machine() {
        let mut h = harness(1.0);
        h.integration.set_fail_register(true);

        h.broker.run_cycle().await.unwrap(); // requested -> booting
        h.broker.run_cycle().await.unwrap(); // booting -> up, register fails

        assert_eq!(
            h.broker.registry().get("m-1").unwrap().state,
            MachineState::Failed
        );
        assert!(event_kinds(&h).contains(&EventKind::RegisterFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_booting_machine_times_out_to_failed() {
        // Booting since the epoch, far past any threshold. The sim does
        // not know vm-9, so the site refresh reports unknown and leaves
        // the state alone; only the sweep acts.
        let machines = vec![machine("m-1", MachineState::Booting, Some("vm-9"), 1000)];
        let mut h = harness_with(test_config(10), 1.0, machines);

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.timed_out, 1);
        assert_eq!(
            h.broker.registry().get("m-1").unwrap().state,
            MachineState::Failed
        );
        assert!(event_kinds(&h).contains(&EventKind::TimeoutExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_failed_machine_is_reaped_to_down() {
        let machines = vec![machine("m-1", MachineState::Failed, Some("vm-1"), 1000)];
        let mut h = harness_with(test_config(10), 1.0, machines);

        let report = h.broker.run_cycle().await.unwrap();

        assert_eq!(report.retired, 1);
        assert!(h.broker.registry().get("m-1").is_none());
        let entries = h.journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["deregister m-1", "terminate vm-1"]);
        assert!(event_kinds(&h).contains(&EventKind::MachineRemoved));
    }

    #[tokio::test(start_paused = true)]
    async fn externally_terminated_machine_is_failed() {
        let t = now();
        let machines = vec![machine("m-1", MachineState::Working, Some("vm-1"), t)];
        let mut h = harness_with(test_config(10), 1.0, machines);
        h.site.set_status("vm-1", SiteStatus::Terminated);
        h.integration.set_status("m-1", BatchStatus::Working);

        h.broker.run_cycle().await.unwrap();

        assert_eq!(
            h.broker.registry().get("m-1").unwrap().state,
            MachineState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_saved_after_each_cycle() {
        let snapshot = RegistrySnapshot::open_in_memory().unwrap();
        let journal: CallJournal = Arc::new(Mutex::new(Vec::new()));
        let site = Arc::new(SimSite::new("site-a").with_journal(journal));
        let integration = Arc::new(SimIntegration::new("condor"));
        let requirement = Arc::new(StaticRequirement::new(
            "condor",
            BTreeMap::from([(TYPE.to_string(), 1.0)]),
        ));
        let mut capabilities = CapabilitySet::new();
        capabilities.add_site(site);
        capabilities.add_integration(integration);
        capabilities.add_requirement(requirement);

        let mut broker = Broker::new(test_config(10), capabilities, EventBus::default())
            .unwrap()
            .with_snapshot(snapshot.clone())
            .unwrap();

        broker.run_cycle().await.unwrap();

        let stored = snapshot.load().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, MachineState::Booting);
        assert_eq!(stored[0].site_id.as_deref(), Some("vm-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn restored_registry_continues_where_it_left_off() {
        let t = now();
        let machines = vec![machine("m-7", MachineState::Working, Some("vm-7"), t)];
        let mut h = harness_with(test_config(10), 2.0, machines);
        h.site.set_status("vm-7", SiteStatus::Running);
        h.integration.set_status("m-7", BatchStatus::Working);

        h.broker.run_cycle().await.unwrap();

        // One surviving machine plus one new one, numbered after the
        // restored id.
        assert_eq!(h.broker.registry().len(), 2);
        assert!(h.broker.registry().get("m-8").is_some());
    }

    #[test]
    fn construction_rejects_unknown_backend_references() {
        let mut config = test_config(10);
        config
            .machine_types
            .get_mut(TYPE)
            .unwrap()
            .site = "nowhere".to_string();

        let mut capabilities = CapabilitySet::new();
        capabilities.add_site(Arc::new(SimSite::new("site-a")));
        capabilities.add_integration(Arc::new(SimIntegration::new("condor")));
        capabilities.add_requirement(Arc::new(StaticRequirement::new(
            "condor",
            BTreeMap::new(),
        )));

        let result = Broker::new(config, capabilities, EventBus::default());
        assert!(matches!(result, Err(BrokerError::UnknownSite { .. })));
    }
}
