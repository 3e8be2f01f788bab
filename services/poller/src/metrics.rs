//! Prometheus self-metrics, threaded as an explicit dependency.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Mutex;

/// Labels of the scheduled-checks gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScheduledChecksLabels {
    pub zone: String,
    pub check_type: String,
}

/// Registry plus the gauges the poller maintains.
pub struct PollerMetrics {
    registry: Mutex<Registry>,
    scheduled_checks: Family<ScheduledChecksLabels, Gauge>,
}

impl PollerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("poller");
        let scheduled_checks = Family::<ScheduledChecksLabels, Gauge>::default();
        registry.register(
            "scheduler_scheduled_checks",
            "Number of checks currently scheduled per zone and type",
            scheduled_checks.clone(),
        );
        PollerMetrics {
            registry: Mutex::new(registry),
            scheduled_checks,
        }
    }

    /// Set the scheduled-checks gauge for one (zone, check_type) pair.
    pub fn set_scheduled_checks(&self, zone: &str, check_type: &str, count: i64) {
        self.scheduled_checks
            .get_or_create(&ScheduledChecksLabels {
                zone: zone.to_owned(),
                check_type: check_type.to_owned(),
            })
            .set(count);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        if let Ok(registry) = self.registry.lock() {
            let _ = encode(&mut out, &registry);
        }
        out
    }
}

impl Default for PollerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
