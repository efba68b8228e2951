//! Fixed-cadence driver for the broker.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::broker::Broker;

/// Runs reconciliation cycles until shutdown is signalled.
///
/// A failed cycle is logged and the loop keeps going; the next cycle
/// re-derives everything from the registry, so a transient registry or
/// snapshot error never wedges the controller.
pub struct ControlLoop {
    broker: Broker,
}

impl ControlLoop {
    pub fn new(broker: Broker) -> Self {
        ControlLoop { broker }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "control loop started");
        loop {
            match self.broker.run_cycle().await {
                Ok(report) => debug!(?report, "cycle finished"),
                Err(e) => error!(error = %e, "cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("control loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
