//! # Prometheus Metrics
//!
//! Operational metrics for the gateway, scraped at `/metrics` on the
//! configured metrics port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] under the
//! `cloak` prefix so they don't collide with the default global registry.
//! Runtime-derived values are refreshed by [`NodeMetrics::observe`], which
//! the sweeper calls on every tick and the API calls after each resolution.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use cloak_contracts::runtime::RuntimeStats;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metric handles for the gateway. Prometheus handles are internally
/// reference-counted, so clones share their values.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// HTTP requests served by the API router.
    pub http_requests_total: IntCounter,
    /// Resolutions accepted and applied.
    pub resolutions_accepted_total: IntCounter,
    /// Resolutions rejected (bad attestation, replay, expiry, ...).
    pub resolutions_rejected_total: IntCounter,
    /// Decryption requests that expired without an answer.
    pub decryptions_expired_total: IntCounter,
    /// Requests currently awaiting a resolution.
    pub pending_decryptions: IntGauge,
    /// Ciphertext records in the store.
    pub ciphertext_handles: IntGauge,
    /// Entries in the event log.
    pub events_logged: IntGauge,
    /// Time spent verifying and applying one resolution.
    pub resolution_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("cloak".into()), None)
            .expect("failed to create prometheus registry");

        let http_requests_total =
            IntCounter::new("http_requests_total", "Total HTTP requests served by the API")
                .expect("metric creation");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("metric registration");

        let resolutions_accepted_total = IntCounter::new(
            "resolutions_accepted_total",
            "Decryption resolutions verified and applied",
        )
        .expect("metric creation");
        registry
            .register(Box::new(resolutions_accepted_total.clone()))
            .expect("metric registration");

        let resolutions_rejected_total = IntCounter::new(
            "resolutions_rejected_total",
            "Decryption resolutions rejected by verification or continuation",
        )
        .expect("metric creation");
        registry
            .register(Box::new(resolutions_rejected_total.clone()))
            .expect("metric registration");

        let decryptions_expired_total = IntCounter::new(
            "decryptions_expired_total",
            "Decryption requests that passed their deadline unanswered",
        )
        .expect("metric creation");
        registry
            .register(Box::new(decryptions_expired_total.clone()))
            .expect("metric registration");

        let pending_decryptions = IntGauge::new(
            "pending_decryptions",
            "Decryption requests currently awaiting a resolution",
        )
        .expect("metric creation");
        registry
            .register(Box::new(pending_decryptions.clone()))
            .expect("metric registration");

        let ciphertext_handles =
            IntGauge::new("ciphertext_handles", "Ciphertext records held by the store")
                .expect("metric creation");
        registry
            .register(Box::new(ciphertext_handles.clone()))
            .expect("metric registration");

        let events_logged = IntGauge::new("events_logged", "Entries in the event log")
            .expect("metric creation");
        registry
            .register(Box::new(events_logged.clone()))
            .expect("metric registration");

        let resolution_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "resolution_latency_seconds",
                "Time to verify and apply one decryption resolution",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(resolution_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            http_requests_total,
            resolutions_accepted_total,
            resolutions_rejected_total,
            decryptions_expired_total,
            pending_decryptions,
            ciphertext_handles,
            events_logged,
            resolution_latency_seconds,
        }
    }

    /// Bring runtime-derived metrics up to date with `stats`.
    pub fn observe(&self, stats: &RuntimeStats) {
        self.pending_decryptions
            .set(stats.pending_decryptions as i64);
        self.ciphertext_handles.set(stats.handles as i64);
        self.events_logged.set(stats.events as i64);
        let seen = self.decryptions_expired_total.get();
        if stats.expired_total > seen {
            self.decryptions_expired_total
                .inc_by(stats.expired_total - seen);
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_tracks_expiries_monotonically() {
        let metrics = NodeMetrics::new();
        let mut stats = RuntimeStats {
            pending_decryptions: 3,
            expired_total: 2,
            ..RuntimeStats::default()
        };
        metrics.observe(&stats);
        assert_eq!(metrics.pending_decryptions.get(), 3);
        assert_eq!(metrics.decryptions_expired_total.get(), 2);

        stats.expired_total = 5;
        stats.pending_decryptions = 0;
        metrics.observe(&stats);
        metrics.observe(&stats);
        assert_eq!(metrics.decryptions_expired_total.get(), 5);
        assert_eq!(metrics.pending_decryptions.get(), 0);
    }

    #[test]
    fn encoding_uses_the_cloak_prefix() {
        let metrics = NodeMetrics::new();
        metrics.http_requests_total.inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("cloak_http_requests_total 1"));
        assert!(text.contains("cloak_pending_decryptions"));
    }
}
