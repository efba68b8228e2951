//! flexgrid-broker — the reconciliation engine.
//!
//! One [`Broker::run_cycle`] call performs, per machine type:
//!
//! 1. **Refresh** — pull site and batch status for known machines and
//!    feed the results into registry transitions; a backend that fails
//!    to respond leaves its machines untouched for the cycle.
//! 2. **Demand aggregation** — sum requirement-capability demand; an
//!    unavailable source contributes zero (fail-open toward "no
//!    additional requirement").
//! 3. **Supply accounting** — machines counted toward capacity.
//! 4. **Delta decision** — provision the shortfall (bounded by the
//!    per-type max-in-flight cap) or retire the excess (failed first,
//!    then longest-idle; machines with running jobs last).
//! 5. **Timeout sweep** — force machines stuck in a non-terminal,
//!    non-working state past their per-state threshold to `failed`.
//!
//! A cycle is a pure function of the registry and the capability
//! responses: no hidden cross-cycle state, so a crash between cycles
//! loses at most one cycle's in-flight decisions. [`ControlLoop`]
//! drives cycles at a fixed cadence until shutdown.

pub mod broker;
pub mod error;
pub mod runner;

pub use broker::{Broker, CapabilitySet, CycleReport};
pub use error::{BrokerError, BrokerResult};
pub use runner::ControlLoop;
