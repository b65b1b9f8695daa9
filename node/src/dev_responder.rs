//! # In-Process Responder
//!
//! Devnet stand-in for the external key-management service. It holds the
//! network key and the responder signing key inside the node, answers every
//! pending decryption request, and feeds the resolutions back through the
//! same verification path an external responder would use.
//!
//! Never enable this on a network whose balances matter: whoever runs the
//! node can read every ciphertext.

use crate::metrics::SharedMetrics;
use cloak_contracts::Runtime;
use cloak_protocol::TrustedResponder;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct DevResponder {
    runtime: Arc<Runtime>,
    responder: TrustedResponder,
    metrics: SharedMetrics,
    interval: Duration,
}

impl DevResponder {
    pub fn new(
        runtime: Arc<Runtime>,
        responder: TrustedResponder,
        metrics: SharedMetrics,
        interval: Duration,
    ) -> Self {
        Self {
            runtime,
            responder,
            metrics,
            interval,
        }
    }

    /// Answer everything currently pending. Returns how many resolutions
    /// the runtime accepted.
    pub fn resolve_pending(&self) -> usize {
        let mut accepted = 0;
        for request in self.runtime.pending_decryptions() {
            let answer = self
                .runtime
                .with_store(|store| self.responder.respond(store, request.id, request.handle));
            let resolution = match answer {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "responder could not open handle");
                    continue;
                }
            };

            let started = Instant::now();
            let result = self.runtime.resolve(resolution);
            self.metrics
                .resolution_latency_seconds
                .observe(started.elapsed().as_secs_f64());
            match result {
                Ok(report) => {
                    debug!(request_id = %report.request_id, purpose = %report.purpose, "dev responder resolved request");
                    self.metrics.resolutions_accepted_total.inc();
                    accepted += 1;
                }
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "dev responder resolution rejected");
                    self.metrics.resolutions_rejected_total.inc();
                }
            }
        }
        if accepted > 0 {
            self.metrics.observe(&self.runtime.stats());
        }
        accepted
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        warn!(
            responder = %self.responder.public_key(),
            "in-process responder enabled; this node can decrypt every balance"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.resolve_pending();

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("dev responder stopped");
    }
}
