//! Queue metrics.
//!
//! Counters are emitted through the `metrics` facade and are no-ops until a
//! recorder is installed; [`init_metrics`] installs a Prometheus one.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

/// Handle on the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!("Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("tickq_scheduled_total", "Entries written by schedule");
    describe_counter!("tickq_unscheduled_total", "Entries removed by unschedule");
    describe_counter!("tickq_claims_total", "Entries moved into the in-flight set");
    describe_counter!("tickq_acknowledged_total", "Claims removed after successful handling");
    describe_counter!("tickq_redeliveries_total", "Claims rescheduled after handler failure");
    describe_counter!("tickq_recovered_total", "Stuck claims rescheduled by recovery");
    describe_counter!(
        "tickq_commit_conflicts_total",
        "Optimistic commits rejected because a watched key changed"
    );
    describe_counter!("tickq_errors_total", "Errors constructed, by code");
    describe_gauge!("tickq_scheduled_entries", "Entries currently in the time index");
    describe_gauge!("tickq_in_flight_entries", "Entries currently in the in-flight set");
    describe_gauge!("tickq_owners", "Owners with at least one scheduled entry");
}

/// Metric helpers used by the queue.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn scheduled(namespace: &str) {
        counter!("tickq_scheduled_total", "namespace" => namespace.to_string()).increment(1);
    }

    pub fn unscheduled(namespace: &str, count: usize) {
        counter!("tickq_unscheduled_total", "namespace" => namespace.to_string())
            .increment(count as u64);
    }

    pub fn claimed(namespace: &str) {
        counter!("tickq_claims_total", "namespace" => namespace.to_string()).increment(1);
    }

    pub fn acknowledged(namespace: &str) {
        counter!("tickq_acknowledged_total", "namespace" => namespace.to_string()).increment(1);
    }

    pub fn redelivered(namespace: &str) {
        counter!("tickq_redeliveries_total", "namespace" => namespace.to_string()).increment(1);
    }

    pub fn recovered(namespace: &str) {
        counter!("tickq_recovered_total", "namespace" => namespace.to_string()).increment(1);
    }

    pub fn commit_conflict(operation: &'static str) {
        counter!("tickq_commit_conflicts_total", "operation" => operation).increment(1);
    }

    /// Publish a stats snapshot as gauges.
    pub fn snapshot(namespace: &str, scheduled: u64, in_flight: u64, owners: u64) {
        let ns = namespace.to_string();
        gauge!("tickq_scheduled_entries", "namespace" => ns.clone()).set(scheduled as f64);
        gauge!("tickq_in_flight_entries", "namespace" => ns.clone()).set(in_flight as f64);
        gauge!("tickq_owners", "namespace" => ns).set(owners as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_render_empty() {
        let config = MetricsConfig {
            enabled: false,
            global_labels: HashMap::new(),
        };
        let registry = init_metrics(&config).unwrap();
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        QueueMetrics::claimed("test");
        QueueMetrics::commit_conflict("claim");
        QueueMetrics::snapshot("test", 3, 1, 2);
    }
}
