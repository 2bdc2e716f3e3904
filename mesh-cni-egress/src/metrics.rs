use std::borrow::Cow;
use std::sync::{LazyLock, RwLock};

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::Error;
use crate::gateway::GatewayHealth;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("mesh_cni_egress")));

#[derive(Clone)]
pub struct EgressMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
    pub route_tables_in_use: Gauge,
    pub health_reports: Family<HealthLabels, Counter>,
}

impl EgressMetrics {
    pub fn new(node_name: &str) -> Self {
        let mut guard = REGISTRY.write().unwrap();
        let registry = guard.sub_registry_with_label((
            Cow::Borrowed("node_name"),
            Cow::Owned(node_name.into()),
        ));
        let runs = Counter::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration = Histogram::new([0.001, 0.01, 0.1, 0.25, 0.5, 1.0, 5.0].into_iter());
        let route_tables_in_use = Gauge::default();
        let health_reports = Family::<HealthLabels, Counter>::default();

        registry.register_with_unit(
            "reconcile_duration",
            "egress reconciliation pass duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of failed egress reconciliation passes",
            failures.clone(),
        );
        registry.register(
            "reconcile_runs",
            "Number of egress reconciliation passes",
            runs.clone(),
        );
        registry.register(
            "route_tables_in_use",
            "Egress routing tables assigned to workloads",
            route_tables_in_use.clone(),
        );
        registry.register(
            "gateway_health_reports",
            "Accepted gateway health transitions",
            health_reports.clone(),
        );
        Self {
            runs,
            failures,
            duration,
            route_tables_in_use,
            health_reports,
        }
    }

    pub fn count_failure(&self, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_health_report(&self, health: GatewayHealth) {
        self.health_reports
            .get_or_create(&HealthLabels {
                health: health.to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        self.metric.observe(self.start.elapsed().as_secs_f64());
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthLabels {
    pub health: String,
}
