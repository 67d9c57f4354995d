//! Process-level instruments registered alongside the metric pipeline.

use std::time::Instant;

use opentelemetry::metrics::Meter;
use opentelemetry::metrics::ObservableGauge;

pub const PROCESS_UPTIME: &str = "process.uptime";

/// Keeps the observable instruments alive for the provider's lifetime.
#[derive(Debug)]
pub struct ProcessMetrics {
    _uptime: ObservableGauge<f64>,
}

impl ProcessMetrics {
    /// Uptime is measured from this call.
    pub fn register(meter: &Meter) -> Self {
        let started = Instant::now();
        let uptime = meter
            .f64_observable_gauge(PROCESS_UPTIME)
            .with_unit("s")
            .with_description("Time since the telemetry pipelines were registered.")
            .with_callback(move |observer| observer.observe(started.elapsed().as_secs_f64(), &[]))
            .build();
        Self { _uptime: uptime }
    }
}
