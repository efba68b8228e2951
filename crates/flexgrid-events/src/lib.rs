//! flexgrid-events — the notification substrate.
//!
//! Every machine lifecycle transition and every diagnostic condition is
//! published here as an immutable [`Event`]. Subscribers observe; they
//! never steer. A broken subscriber is logged and skipped so one bad
//! observer cannot abort a reconciliation cycle.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventFilter, EventHandler, SubscriberId};
pub use event::{Event, EventKind};
