//! flexgrid.toml configuration parser.
//!
//! The configuration enumerates, per machine type, which requirement /
//! site / integration backend instances apply, the per-state lifecycle
//! timeouts, and the max-in-flight provisioning bound, plus the global
//! cycle cadence and the optional registry snapshot path. Backend
//! instances are a closed set of variants selected by `kind`, not
//! discovered at runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between reconciliation cycles.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Bound on every single capability call; an overrun counts as a
    /// capability failure for that cycle.
    #[serde(default = "default_capability_timeout")]
    pub capability_timeout_secs: u64,
    /// Registry snapshot location. Absent means in-memory only.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Managed machine flavors, keyed by type name.
    ///
    /// BTreeMap so cycles visit types in a stable order.
    pub machine_types: BTreeMap<String, MachineTypeConfig>,
    /// Site backend instances, keyed by logical name.
    #[serde(default)]
    pub sites: BTreeMap<String, BackendKind>,
    /// Integration backend instances, keyed by logical name.
    #[serde(default)]
    pub integrations: BTreeMap<String, BackendKind>,
    /// Requirement backend instances, keyed by logical name.
    #[serde(default)]
    pub requirements: BTreeMap<String, BackendKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineTypeConfig {
    /// Logical name of the owning site backend.
    pub site: String,
    /// Logical name of the owning integration backend.
    pub integration: String,
    /// Requirement backends whose demand is summed for this type.
    pub requirements: Vec<String>,
    /// Maximum machines in `requested`/`booting` at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default)]
    pub timeouts: StateTimeouts,
}

/// Per-state lifecycle timeouts in seconds.
///
/// A machine sitting in one of these states longer than its threshold is
/// forced to `failed` by the broker's timeout sweep. `working` and the
/// terminal states never time out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTimeouts {
    #[serde(default = "default_requested_secs")]
    pub requested_secs: u64,
    #[serde(default = "default_booting_secs")]
    pub booting_secs: u64,
    #[serde(default = "default_up_secs")]
    pub up_secs: u64,
    #[serde(default = "default_integrating_secs")]
    pub integrating_secs: u64,
    #[serde(default = "default_disintegrating_secs")]
    pub disintegrating_secs: u64,
    /// How long a machine may sit in `failed` before the sweep forces it
    /// down and out of the registry.
    #[serde(default = "default_failed_secs")]
    pub failed_secs: u64,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        StateTimeouts {
            requested_secs: default_requested_secs(),
            booting_secs: default_booting_secs(),
            up_secs: default_up_secs(),
            integrating_secs: default_integrating_secs(),
            disintegrating_secs: default_disintegrating_secs(),
            failed_secs: default_failed_secs(),
        }
    }
}

/// Closed set of backend variants selectable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process simulator (tests, simulate mode).
    Sim,
    /// Fixed demand per machine type, straight from configuration.
    Static {
        #[serde(default)]
        demand: BTreeMap<String, f64>,
    },
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_cycle_interval() -> u64 {
    30
}

fn default_capability_timeout() -> u64 {
    10
}

fn default_max_in_flight() -> u32 {
    10
}

fn default_requested_secs() -> u64 {
    600
}

fn default_booting_secs() -> u64 {
    1200
}

fn default_up_secs() -> u64 {
    600
}

fn default_integrating_secs() -> u64 {
    600
}

fn default_disintegrating_secs() -> u64 {
    1200
}

fn default_failed_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cycle_interval_secs = 15
capability_timeout_secs = 5

[machine_types.cloud-small]
site = "cloud-a"
integration = "condor"
requirements = ["condor"]
max_in_flight = 4

[machine_types.cloud-small.timeouts]
booting_secs = 300

[sites.cloud-a]
kind = "sim"

[integrations.condor]
kind = "sim"

[requirements.condor]
kind = "static"

[requirements.condor.demand]
cloud-small = 3.0
"#;

    #[test]
    fn parses_sample_config() {
        let config: ControllerConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.cycle_interval_secs, 15);
        assert_eq!(config.capability_timeout_secs, 5);
        assert!(config.snapshot_path.is_none());

        let mt = &config.machine_types["cloud-small"];
        assert_eq!(mt.site, "cloud-a");
        assert_eq!(mt.integration, "condor");
        assert_eq!(mt.requirements, vec!["condor".to_string()]);
        assert_eq!(mt.max_in_flight, 4);
        // Overridden value plus defaults for the rest.
        assert_eq!(mt.timeouts.booting_secs, 300);
        assert_eq!(mt.timeouts.requested_secs, 600);
    }

    #[test]
    fn backend_kinds_parse() {
        let config: ControllerConfig = toml::from_str(SAMPLE).unwrap();
        assert!(matches!(config.sites["cloud-a"], BackendKind::Sim));
        match &config.requirements["condor"] {
            BackendKind::Static { demand } => {
                assert_eq!(demand["cloud-small"], 3.0);
            }
            other => panic!("unexpected backend kind: {other:?}"),
        }
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let minimal = r#"
[machine_types.t1]
site = "s"
integration = "i"
requirements = []
"#;
        let config: ControllerConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.cycle_interval_secs, 30);
        assert_eq!(config.capability_timeout_secs, 10);
        let mt = &config.machine_types["t1"];
        assert_eq!(mt.max_in_flight, 10);
        assert_eq!(mt.timeouts.disintegrating_secs, 1200);
        assert_eq!(mt.timeouts.failed_secs, 600);
    }

    #[test]
    fn round_trips_through_toml() {
        let config: ControllerConfig = toml::from_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed: ControllerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(
            reparsed.machine_types["cloud-small"].max_in_flight,
            config.machine_types["cloud-small"].max_in_flight
        );
    }
}
