//! Prometheus metrics for the ingestion service.
//!
//! ## Metrics
//!
//! **Counters:**
//! - `fm_batches_total`: batches by outcome (committed/rejected)
//! - `fm_entries_total`: committed entries by type
//! - `fm_ingest_failures_total`: rejected batches by failure category
//! - `fm_http_requests_total`: requests by route and status
//!
//! **Histograms:**
//! - `fm_ingest_duration_seconds`: wall time of one ingestion by outcome
//!
//! **Info:**
//! - `fm_build_info`: version

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::batch::EntryKind;
use crate::ingest::{IngestFailure, IngestReport};

/// Prometheus metrics collection for the server.
///
/// Cloning shares the underlying counters; every worker holds a clone.
#[derive(Clone)]
pub struct IngestMetrics {
    pub registry: Registry,

    pub batches_total: IntCounterVec,
    pub entries_total: IntCounterVec,
    pub ingest_failures_total: IntCounterVec,
    pub http_requests_total: IntCounterVec,

    pub ingest_duration_seconds: HistogramVec,
}

impl IngestMetrics {
    /// Create a new metrics collection and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let batches_total = IntCounterVec::new(
            Opts::new("fm_batches_total", "Uploaded batches by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(batches_total.clone()))?;

        let entries_total = IntCounterVec::new(
            Opts::new("fm_entries_total", "Committed batch entries by type"),
            &["type"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let ingest_failures_total = IntCounterVec::new(
            Opts::new(
                "fm_ingest_failures_total",
                "Rejected batches by failure category",
            ),
            &["category"],
        )?;
        registry.register(Box::new(ingest_failures_total.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("fm_http_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let ingest_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fm_ingest_duration_seconds",
                "Batch ingestion duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(ingest_duration_seconds.clone()))?;

        let build_info = IntGauge::with_opts(
            Opts::new("fm_build_info", "Build information")
                .const_label("version", env!("CARGO_PKG_VERSION")),
        )?;
        build_info.set(1);
        registry.register(Box::new(build_info))?;

        // Pre-create label sets so dashboards see zeros before the first upload.
        for outcome in ["committed", "rejected"] {
            batches_total.with_label_values(&[outcome]);
        }
        for kind in EntryKind::ALL {
            entries_total.with_label_values(&[kind.as_str()]);
        }

        Ok(Self {
            registry,
            batches_total,
            entries_total,
            ingest_failures_total,
            http_requests_total,
            ingest_duration_seconds,
        })
    }

    /// Record a committed batch.
    pub fn record_committed(&self, report: &IngestReport, duration_secs: f64) {
        self.batches_total.with_label_values(&["committed"]).inc();
        self.ingest_duration_seconds
            .with_label_values(&["committed"])
            .observe(duration_secs);

        let tally = report.entry_kinds;
        for (kind, n) in [
            (EntryKind::Success, tally.success),
            (EntryKind::Failure, tally.failure),
            (EntryKind::UnexpectedSignal, tally.unexpected_signal),
        ] {
            self.entries_total
                .with_label_values(&[kind.as_str()])
                .inc_by(n as u64);
        }
    }

    /// Record a rejected batch.
    pub fn record_rejected(&self, failure: &IngestFailure, duration_secs: f64) {
        self.record_rejected_category(failure.error.failure_category().as_str());
        self.ingest_duration_seconds
            .with_label_values(&["rejected"])
            .observe(duration_secs);
    }

    /// Record a batch rejected before ingestion started (oversized body).
    pub fn record_rejected_category(&self, category: &str) {
        self.batches_total.with_label_values(&["rejected"]).inc();
        self.ingest_failures_total
            .with_label_values(&[category])
            .inc();
    }

    pub fn record_request(&self, route: &str, status: u16) {
        self.http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::run_ingest;
    use crate::store::Store;

    #[test]
    fn test_metrics_creation() {
        let metrics = IngestMetrics::new().unwrap();
        let output = metrics.render().unwrap();
        assert!(output.contains("fm_build_info"));
        assert!(output.contains(&format!("version=\"{}\"", env!("CARGO_PKG_VERSION"))));
        assert!(output.contains("fm_batches_total{outcome=\"committed\"} 0"));
    }

    #[test]
    fn test_committed_and_rejected_batches() {
        let metrics = IngestMetrics::new().unwrap();
        let mut store = Store::open_in_memory().unwrap();

        let report = run_ingest(
            &mut store,
            br#"{"fuzzer-host":"fh","fuzzer-user":"u","testing-host":"th","arch":"x86",
                "entries":[{"type":"success","opcode":"ADD","count":1},
                           {"type":"success","opcode":"SUB","count":2}]}"#,
        )
        .unwrap();
        metrics.record_committed(&report, 0.01);

        let failure = run_ingest(&mut store, b"[]").unwrap_err();
        metrics.record_rejected(&failure, 0.002);
        metrics.record_rejected_category("invalid_value");

        let output = metrics.render().unwrap();
        assert!(output.contains("fm_batches_total{outcome=\"committed\"} 1"));
        assert!(output.contains("fm_batches_total{outcome=\"rejected\"} 2"));
        assert!(output.contains("fm_entries_total{type=\"success\"} 2"));
        assert!(output.contains("fm_ingest_failures_total{category=\"type_error\"} 1"));
        assert!(output.contains("fm_ingest_failures_total{category=\"invalid_value\"} 1"));
        assert!(output.contains("# TYPE fm_ingest_duration_seconds histogram"));
    }

    #[test]
    fn test_request_counter() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.record_request("upload_batch", 200);
        metrics.record_request("upload_batch", 200);
        metrics.record_request("not_found", 404);
        let output = metrics.render().unwrap();
        assert!(output.contains("fm_http_requests_total{route=\"upload_batch\",status=\"200\"} 2"));
        assert!(output.contains("fm_http_requests_total{route=\"not_found\",status=\"404\"} 1"));
    }
}
