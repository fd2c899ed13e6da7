use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGauge, Registry};
use tokio::time::Instant;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub leader: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "gitops_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "gitops_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["controller", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!("gitops_operator_reconciliations_total", "reconciliations"),
            &["controller"],
        )
        .unwrap();
        let leader = IntGauge::new(
            "gitops_operator_leader",
            "Whether this replica holds the leader lease",
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            leader,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.leader.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.with_label_values(&[controller]).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            controller: controller.to_string(),
        }
    }

    pub fn set_leader(&self, leading: bool) {
        self.leader.set(i64::from(leading));
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    controller: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.controller.as_str()])
            .observe(duration);
    }
}
