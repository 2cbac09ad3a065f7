//! Prometheus metrics for the local builder

use crate::builder::BuildResult;
use crate::error::FailureKind;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Opts, Registry,
};

/// Build outcome and worker churn counters
#[derive(Clone)]
pub struct BuilderMetrics {
    /// Label `outcome`: success, exception, timeout, other
    pub builds: IntCounterVec,
    pub worker_restarts: IntCounter,
}

impl BuilderMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            builds: register_int_counter_vec_with_registry!(
                Opts::new("autotune_builds_total", "Build tasks by outcome"),
                &["outcome"],
                registry
            )?,
            worker_restarts: register_int_counter_with_registry!(
                Opts::new(
                    "autotune_worker_restarts_total",
                    "Workers killed and replaced after a timeout or crash"
                ),
                registry
            )?,
        })
    }

    pub fn observe(&self, result: &BuildResult) {
        let outcome = match FailureKind::of(result) {
            None => "success",
            Some(kind) => kind.as_str(),
        };
        self.builds.with_label_values(&[outcome]).inc();
    }

    pub fn count(&self, outcome: &str) -> u64 {
        self.builds.with_label_values(&[outcome]).get()
    }
}
