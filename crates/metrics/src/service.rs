use dockhand_models::{DockhandError, StageKind};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

fn internal(e: prometheus::Error) -> DockhandError {
    DockhandError::InternalError {
        reason: e.to_string(),
    }
}

pub struct MetricsService {
    registry: Registry,
    builds_total: IntCounter,
    build_failures_total: IntCounterVec,
    steps_cached_total: IntCounterVec,
    step_duration_ms: HistogramVec,
}

impl MetricsService {
    pub fn new() -> Result<Self, DockhandError> {
        let registry = Registry::new();

        let builds_total = IntCounter::new("dockhand_builds_total", "Total number of builds started")
            .map_err(internal)?;

        let build_failures_total = IntCounterVec::new(
            Opts::new(
                "dockhand_build_failures_total",
                "Total number of failed builds by phase",
            ),
            &["phase"],
        )
        .map_err(internal)?;

        let steps_cached_total = IntCounterVec::new(
            Opts::new(
                "dockhand_steps_cached_total",
                "Total number of pipeline steps reused from the layer cache",
            ),
            &["stage"],
        )
        .map_err(internal)?;

        let step_duration_ms = HistogramVec::new(
            HistogramOpts::new(
                "dockhand_step_duration_ms",
                "Pipeline step duration in milliseconds",
            )
            .buckets(vec![
                10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0,
            ]),
            &["stage"],
        )
        .map_err(internal)?;

        registry
            .register(Box::new(builds_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(build_failures_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(steps_cached_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(step_duration_ms.clone()))
            .map_err(internal)?;

        Ok(Self {
            registry,
            builds_total,
            build_failures_total,
            steps_cached_total,
            step_duration_ms,
        })
    }

    pub fn record_build_started(&self) {
        self.builds_total.inc();
    }

    pub fn record_build_failure(&self, err: &DockhandError) {
        self.build_failures_total
            .with_label_values(&[&err.phase().to_string()])
            .inc();
    }

    pub fn record_cache_hit(&self, stage: StageKind) {
        self.steps_cached_total
            .with_label_values(&[&stage.to_string()])
            .inc();
    }

    pub fn record_step_duration(&self, stage: StageKind, duration_ms: f64) {
        self.step_duration_ms
            .with_label_values(&[&stage.to_string()])
            .observe(duration_ms);
    }

    pub fn cached_steps(&self, stage: StageKind) -> u64 {
        self.steps_cached_total
            .with_label_values(&[&stage.to_string()])
            .get()
    }

    pub fn get_prometheus_metrics(&self) -> Result<String, DockhandError> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(internal)?;

        String::from_utf8(buffer).map_err(|e| DockhandError::InternalError {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exposition_contains_counters() {
        let metrics = MetricsService::new().unwrap();
        metrics.record_build_started();
        metrics.record_cache_hit(StageKind::Dependencies);
        metrics.record_step_duration(StageKind::Assembly, 12.0);
        metrics.record_build_failure(&DockhandError::LockFileMissing {
            path: "requirements.lock".into(),
        });

        assert_eq!(metrics.cached_steps(StageKind::Dependencies), 1);
        assert_eq!(metrics.cached_steps(StageKind::Base), 0);

        let text = metrics.get_prometheus_metrics().unwrap();
        assert!(text.contains("dockhand_builds_total 1"));
        assert!(text.contains("dockhand_steps_cached_total{stage=\"dependencies\"} 1"));
        assert!(text.contains("dockhand_build_failures_total{phase=\"dependencies\"} 1"));
        assert!(text.contains("dockhand_step_duration_ms_bucket"));
    }
}
