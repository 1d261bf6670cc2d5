//! Prometheus metrics for the collector.
//!
//! This module provides metric collection for every pipeline stage:
//! - Ingestion (captured, duplicate, malformed, redelivered, dead-lettered)
//! - Lifecycle transitions
//! - Retry attempts
//! - Fan-out delivery and latency
//! - Rate limiter rejections
//!
//! # Example
//!
//! ```rust,no_run
//! use exception_collector_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use exception_collector_core::lifecycle::{ActionKind, MutationKind};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the scrape endpoint.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves the existing one in place.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // `ExporterError` implements neither Display nor Debug in
            // metrics-exporter-prometheus 0.15, so it cannot be logged as a field.
            if exporter.await.is_err() {
                tracing::error!("Metrics endpoint stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Ingestion
    describe_counter!(
        "exceptions_ingested_total",
        "Inbound failure events stored as new exceptions"
    );
    describe_counter!(
        "exceptions_duplicate_total",
        "Inbound events whose transaction id was already stored"
    );
    describe_counter!(
        "ingestion_malformed_total",
        "Inbound events dropped as malformed"
    );
    describe_counter!(
        "ingestion_redeliveries_total",
        "Redeliveries of inbound events after transient failures"
    );
    describe_counter!(
        "ingestion_dead_lettered_total",
        "Inbound events routed to the dead-letter destination"
    );
    describe_gauge!("dlq_size", "Letters held by the in-memory dead-letter queue");
    describe_counter!(
        "dlq_rejected_total",
        "Letters refused because the dead-letter queue was full"
    );

    // Lifecycle
    describe_counter!(
        "lifecycle_transitions_total",
        "Applied lifecycle transitions, by action"
    );
    describe_counter!(
        "retry_attempts_total",
        "Retry attempts by outcome (initiated, success, failed, cancelled)"
    );
    describe_counter!(
        "optimistic_conflicts_total",
        "Versioned writes that lost a concurrent update"
    );

    // Fan-out
    describe_counter!(
        "fanout_published_total",
        "Change events delivered to an external publisher"
    );
    describe_counter!(
        "fanout_failures_total",
        "Change event deliveries that failed or timed out"
    );
    describe_counter!(
        "fanout_sla_breaches_total",
        "Change event deliveries slower than the fan-out SLA"
    );
    describe_histogram!(
        "fanout_latency_seconds",
        "Time from publish to delivery per external publisher"
    );

    // Rate limiting
    describe_counter!(
        "rate_limit_rejections_total",
        "Mutations rejected by the rate limiter, by operation"
    );
}

/// Ingestion metrics recorder.
pub struct IngestionMetrics;

impl IngestionMetrics {
    /// Record a newly stored exception.
    pub fn record_ingested() {
        counter!("exceptions_ingested_total").increment(1);
    }

    /// Record a duplicate delivery.
    pub fn record_duplicate() {
        counter!("exceptions_duplicate_total").increment(1);
    }

    /// Record a malformed event.
    pub fn record_malformed() {
        counter!("ingestion_malformed_total").increment(1);
    }

    /// Record a redelivery.
    pub fn record_redelivery() {
        counter!("ingestion_redeliveries_total").increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered() {
        counter!("ingestion_dead_lettered_total").increment(1);
    }
}

/// Lifecycle metrics recorder.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    /// Record an applied transition.
    pub fn record_transition(action: ActionKind) {
        counter!("lifecycle_transitions_total", "action" => action.as_str()).increment(1);
    }

    /// Record a lost optimistic write.
    pub fn record_conflict() {
        counter!("optimistic_conflicts_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record an opened attempt.
    pub fn record_initiated() {
        counter!("retry_attempts_total", "outcome" => "initiated").increment(1);
    }

    /// Record a sealed attempt with its outcome.
    pub fn record_completed(success: bool) {
        let outcome = if success { "success" } else { "failed" };
        counter!("retry_attempts_total", "outcome" => outcome).increment(1);
    }

    /// Record a cancelled attempt.
    pub fn record_cancelled() {
        counter!("retry_attempts_total", "outcome" => "cancelled").increment(1);
    }
}

/// Fan-out metrics recorder.
pub struct FanoutMetrics;

impl FanoutMetrics {
    /// Record a delivery to an external publisher.
    pub fn record_published(publisher: &'static str, latency: Duration) {
        counter!("fanout_published_total", "publisher" => publisher).increment(1);
        histogram!("fanout_latency_seconds", "publisher" => publisher)
            .record(latency.as_secs_f64());
    }

    /// Record a failed or timed-out delivery.
    pub fn record_failure(publisher: &'static str) {
        counter!("fanout_failures_total", "publisher" => publisher).increment(1);
    }

    /// Record a delivery slower than the SLA.
    pub fn record_sla_breach(publisher: &'static str) {
        counter!("fanout_sla_breaches_total", "publisher" => publisher).increment(1);
    }
}

/// Rate limiter metrics recorder.
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    /// Record a rejected mutation.
    pub fn record_rejection(operation: MutationKind) {
        counter!("rate_limit_rejections_total", "operation" => operation.as_str()).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        IngestionMetrics::record_ingested();
        LifecycleMetrics::record_transition(ActionKind::Acknowledge);
        RetryMetrics::record_completed(true);
        FanoutMetrics::record_published("kafka", Duration::from_millis(40));
        RateLimitMetrics::record_rejection(MutationKind::Resolve);

        // Another test may have installed the recorder first; metrics are
        // still recorded globally in that case.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("exceptions_ingested_total"));
            assert!(rendered.contains("lifecycle_transitions_total"));
            assert!(rendered.contains("fanout_latency_seconds"));
            assert!(rendered.contains("rate_limit_rejections_total"));
        }
    }

    #[tokio::test]
    async fn second_start_is_tolerated() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        first.start().unwrap();
        second.start().unwrap();
        assert!(first.handle().is_none() || second.handle().is_none());
    }
}
