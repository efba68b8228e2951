//! Built-in backends: static demand and an in-process site/batch
//! simulator.
//!
//! These are real capability implementations, selected from
//! configuration like any other backend. The daemon's simulate mode
//! runs a full reconciliation loop against them, and the broker tests
//! use their failure switches to script degraded-backend scenarios.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use flexgrid_core::MachineId;
use flexgrid_registry::Machine;

use crate::contract::{
    BatchStatus, CapFuture, IntegrationCapability, RequirementCapability, SiteCapability,
    SiteStatus,
};
use crate::error::CapabilityError;

/// Shared call journal used by tests to assert cross-backend ordering
/// (deregistration before termination).
pub type CallJournal = Arc<Mutex<Vec<String>>>;

/// Fixed demand per machine type, adjustable at runtime.
pub struct StaticRequirement {
    name: String,
    demand: Mutex<BTreeMap<String, f64>>,
    unavailable: AtomicBool,
}

impl StaticRequirement {
    pub fn new(name: impl Into<String>, demand: BTreeMap<String, f64>) -> Self {
        StaticRequirement {
            name: name.into(),
            demand: Mutex::new(demand),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_demand(&self, machine_type: &str, value: f64) {
        self.demand
            .lock()
            .unwrap()
            .insert(machine_type.to_string(), value);
    }

    /// Flip the backend into (or out of) transient failure.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl RequirementCapability for StaticRequirement {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_demand<'a>(&'a self, machine_type: &'a str) -> CapFuture<'a, f64> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CapabilityError::Unavailable(format!(
                    "{} not responding",
                    self.name
                )));
            }
            Ok(self
                .demand
                .lock()
                .unwrap()
                .get(machine_type)
                .copied()
                .unwrap_or(0.0))
        })
    }
}

/// In-process compute backend. Provisioned machines report `Running`
/// immediately; tests override per-machine status via `set_status`.
pub struct SimSite {
    name: String,
    next_id: AtomicU64,
    machines: Mutex<BTreeMap<String, SiteStatus>>,
    provision_calls: AtomicUsize,
    fail_provision: AtomicBool,
    fail_terminate: AtomicBool,
    /// When set, every call hangs forever — the per-call timeout in the
    /// broker turns that into a degraded capability.
    unreachable: AtomicBool,
    journal: Option<CallJournal>,
}

impl SimSite {
    pub fn new(name: impl Into<String>) -> Self {
        SimSite {
            name: name.into(),
            next_id: AtomicU64::new(1),
            machines: Mutex::new(BTreeMap::new()),
            provision_calls: AtomicUsize::new(0),
            fail_provision: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn set_fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_terminate(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Test hook: override the reported status of one machine.
    pub fn set_status(&self, site_id: &str, status: SiteStatus) {
        self.machines
            .lock()
            .unwrap()
            .insert(site_id.to_string(), status);
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    fn record(&self, entry: String) {
        if let Some(ref journal) = self.journal {
            journal.lock().unwrap().push(entry);
        }
    }
}

impl SiteCapability for SimSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn provision<'a>(&'a self, machine_type: &'a str) -> CapFuture<'a, String> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            self.provision_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_provision.load(Ordering::SeqCst) {
                return Err(CapabilityError::Provision(format!(
                    "{} rejected {machine_type}",
                    self.name
                )));
            }
            let site_id = format!("vm-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.machines
                .lock()
                .unwrap()
                .insert(site_id.clone(), SiteStatus::Running);
            self.record(format!("provision {site_id}"));
            Ok(site_id)
        })
    }

    fn query_status<'a>(&'a self, site_id: &'a str) -> CapFuture<'a, SiteStatus> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            Ok(self
                .machines
                .lock()
                .unwrap()
                .get(site_id)
                .copied()
                .unwrap_or(SiteStatus::Unknown))
        })
    }

    fn terminate<'a>(&'a self, site_id: &'a str) -> CapFuture<'a, ()> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            if self.fail_terminate.load(Ordering::SeqCst) {
                return Err(CapabilityError::Terminate(format!(
                    "{} refused to terminate {site_id}",
                    self.name
                )));
            }
            self.machines
                .lock()
                .unwrap()
                .insert(site_id.to_string(), SiteStatus::Terminated);
            self.record(format!("terminate {site_id}"));
            Ok(())
        })
    }
}

/// In-process batch system. Registered workers start out idle.
pub struct SimIntegration {
    name: String,
    workers: Mutex<BTreeMap<MachineId, BatchStatus>>,
    fail_register: AtomicBool,
    fail_deregister: AtomicBool,
    unreachable: AtomicBool,
    journal: Option<CallJournal>,
}

impl SimIntegration {
    pub fn new(name: impl Into<String>) -> Self {
        SimIntegration {
            name: name.into(),
            workers: Mutex::new(BTreeMap::new()),
            fail_register: AtomicBool::new(false),
            fail_deregister: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deregister(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Test hook: override the reported batch status of one machine.
    pub fn set_status(&self, machine_id: &str, status: BatchStatus) {
        self.workers
            .lock()
            .unwrap()
            .insert(machine_id.to_string(), status);
    }

    pub fn is_registered(&self, machine_id: &str) -> bool {
        self.workers.lock().unwrap().contains_key(machine_id)
    }

    fn record(&self, entry: String) {
        if let Some(ref journal) = self.journal {
            journal.lock().unwrap().push(entry);
        }
    }
}

impl IntegrationCapability for SimIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    fn register<'a>(&'a self, machine: &'a Machine) -> CapFuture<'a, ()> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            if self.fail_register.load(Ordering::SeqCst) {
                return Err(CapabilityError::Register(format!(
                    "{} rejected {}",
                    self.name, machine.id
                )));
            }
            self.workers.lock().unwrap().insert(
                machine.id.clone(),
                BatchStatus::Idle {
                    idle_since: epoch_secs(),
                },
            );
            self.record(format!("register {}", machine.id));
            Ok(())
        })
    }

    fn query_status<'a>(&'a self, machine: &'a Machine) -> CapFuture<'a, BatchStatus> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            Ok(self
                .workers
                .lock()
                .unwrap()
                .get(&machine.id)
                .copied()
                .unwrap_or(BatchStatus::Unknown))
        })
    }

    fn deregister<'a>(&'a self, machine: &'a Machine) -> CapFuture<'a, ()> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            if self.fail_deregister.load(Ordering::SeqCst) {
                return Err(CapabilityError::Deregister(format!(
                    "{} could not drain {}",
                    self.name, machine.id
                )));
            }
            // Unknown machines count as already deregistered.
            self.workers.lock().unwrap().remove(&machine.id);
            self.record(format!("deregister {}", machine.id));
            Ok(())
        })
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
    use std::time::Duration;

    use flexgrid_registry::MachineState;

    fn test_machine(id: &str) -> Machine {
        Machine {
            id: id.to_string(),
            machine_type: "cloud-small".to_string(),
            state: MachineState::Up,
            site_id: Some("vm-1".to_string()),
            site: "site-a".to_string(),
            integration: "condor".to_string(),
            backend_attributes: HashMap::new(),
            state_changed_at: 1000,
        }
    }

    #[tokio::test]
    async fn static_requirement_reports_configured_demand() {
        let req = StaticRequirement::new(
            "condor",
            BTreeMap::from([("cloud-small".to_string(), 4.0)]),
        );

        assert_eq!(req.get_demand("cloud-small").await.unwrap(), 4.0);
        assert_eq!(req.get_demand("cloud-large").await.unwrap(), 0.0);

        req.set_demand("cloud-large", 2.0);
        assert_eq!(req.get_demand("cloud-large").await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn unavailable_requirement_errors_instead_of_stale_data() {
        let req = StaticRequirement::new(
            "condor",
            BTreeMap::from([("cloud-small".to_string(), 4.0)]),
        );
        req.set_unavailable(true);

        assert!(matches!(
            req.get_demand("cloud-small").await,
            Err(CapabilityError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn provision_assigns_unique_site_ids() {
        let site = SimSite::new("site-a");
        let a = site.provision("cloud-small").await.unwrap();
        let b = site.provision("cloud-small").await.unwrap();

        assert_ne!(a, b);
        assert_eq!(site.provision_calls(), 2);
        assert_eq!(site.query_status(&a).await.unwrap(), SiteStatus::Running);
    }

    #[tokio::test]
    async fn provision_rejection_is_an_error() {
        let site = SimSite::new("site-a");
        site.set_fail_provision(true);

        assert!(matches!(
            site.provision("cloud-small").await,
            Err(CapabilityError::Provision(_))
        ));
        // The call was made, even though it was rejected.
        assert_eq!(site.provision_calls(), 1);
    }

    #[tokio::test]
    async fn terminate_moves_machine_to_terminated() {
        let site = SimSite::new("site-a");
        let id = site.provision("cloud-small").await.unwrap();
        site.terminate(&id).await.unwrap();

        assert_eq!(site.query_status(&id).await.unwrap(), SiteStatus::Terminated);
    }

    #[tokio::test]
    async fn unknown_site_id_reports_unknown() {
        let site = SimSite::new("site-a");
        assert_eq!(
            site.query_status("vm-404").await.unwrap(),
            SiteStatus::Unknown
        );
    }

    #[tokio::test]
    async fn unreachable_site_hangs_until_timeout() {
        let site = SimSite::new("site-a");
        site.set_unreachable(true);

        let result =
            tokio::time::timeout(Duration::from_millis(20), site.query_status("vm-1")).await;
        assert!(result.is_err(), "call should still be pending");
    }

    #[tokio::test]
    async fn register_then_status_then_deregister() {
        let integration = SimIntegration::new("condor");
        let machine = test_machine("m-1");

        integration.register(&machine).await.unwrap();
        assert!(matches!(
            integration.query_status(&machine).await.unwrap(),
            BatchStatus::Idle { .. }
        ));

        integration.deregister(&machine).await.unwrap();
        assert_eq!(
            integration.query_status(&machine).await.unwrap(),
            BatchStatus::Unknown
        );
    }

    #[tokio::test]
    async fn deregister_of_unknown_machine_is_idempotent() {
        let integration = SimIntegration::new("condor");
        let machine = test_machine("m-404");

        assert!(integration.deregister(&machine).await.is_ok());
    }

    #[tokio::test]
    async fn journal_records_cross_backend_ordering() {
        let journal: CallJournal = Arc::new(Mutex::new(Vec::new()));
        let site = SimSite::new("site-a").with_journal(journal.clone());
        let integration = SimIntegration::new("condor").with_journal(journal.clone());

        let machine = test_machine("m-1");
        integration.register(&machine).await.unwrap();
        integration.deregister(&machine).await.unwrap();
        let site_id = site.provision("cloud-small").await.unwrap();
        site.terminate(&site_id).await.unwrap();

        let entries = journal.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "register m-1",
                "deregister m-1",
                "provision vm-1",
                "terminate vm-1"
            ]
        );
    }
}
