//! # Expiry Sweeper
//!
//! Background task that expires overdue decryption requests on a fixed
//! interval and refreshes the runtime gauges.
//!
//! Every runtime transition already sweeps before it runs, so a busy node
//! never leaves a request past its deadline. The sweeper covers the idle
//! case: without it, a withdrawal nobody touches would sit in `Pending`
//! with its shares locked until the next unrelated call.

use crate::metrics::SharedMetrics;
use cloak_contracts::Runtime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ExpirySweeper {
    runtime: Arc<Runtime>,
    metrics: SharedMetrics,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(runtime: Arc<Runtime>, metrics: SharedMetrics, interval: Duration) -> Self {
        Self {
            runtime,
            metrics,
            interval,
        }
    }

    /// One pass. Returns how many requests expired.
    pub fn sweep_once(&self) -> usize {
        let expired = match self.runtime.expire_stale() {
            Ok(expired) => expired.len(),
            Err(e) => {
                warn!(error = %e, "expiry sweep failed");
                0
            }
        };
        self.metrics.observe(&self.runtime.stats());
        expired
    }

    /// Sweeps until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "expiry sweeper starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let expired = self.sweep_once();
            if expired > 0 {
                debug!(expired, "sweep pass");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{devnet_fixture, queue_unwrap};
    use crate::metrics::NodeMetrics;
    use chrono::Utc;
    use cloak_contracts::ledger::UnwrapStatus;
    use cloak_protocol::{Clock, ManualClock};

    #[test]
    fn sweep_once_expires_overdue_requests() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (runtime, _) = devnet_fixture(clock.clone() as Arc<dyn Clock>);
        let (ledger, id) = queue_unwrap(&runtime);
        let metrics = Arc::new(NodeMetrics::new());
        let sweeper = ExpirySweeper::new(runtime.clone(), metrics.clone(), Duration::from_secs(5));

        assert_eq!(sweeper.sweep_once(), 0);
        assert_eq!(metrics.pending_decryptions.get(), 1);

        clock.advance(chrono::Duration::seconds(300));
        assert_eq!(sweeper.sweep_once(), 1);
        assert_eq!(sweeper.sweep_once(), 0);
        assert_eq!(metrics.decryptions_expired_total.get(), 1);
        assert_eq!(metrics.pending_decryptions.get(), 0);

        let request = runtime.unwrap_request(ledger, &id).unwrap().unwrap();
        assert_eq!(request.status, UnwrapStatus::Expired);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_sweeper() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (runtime, _) = devnet_fixture(clock.clone() as Arc<dyn Clock>);
        queue_unwrap(&runtime);
        clock.advance(chrono::Duration::seconds(301));

        let metrics = Arc::new(NodeMetrics::new());
        let sweeper = ExpirySweeper::new(runtime.clone(), metrics.clone(), Duration::from_millis(20));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = shutdown_tx.send(true);
        });

        sweeper.run(shutdown_rx).await;
        assert_eq!(runtime.stats().expired_total, 1);
        assert_eq!(metrics.decryptions_expired_total.get(), 1);
    }
}
