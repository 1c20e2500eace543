// Metric names and label sets below are static; construction only fails on invalid names.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Capture ====
    pub static ref FRAMES_CAPTURED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("analytics_frames_captured_total", "Frames read from capture sources"),
            &["stream"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ACTIVE_WORKERS: IntGauge = {
        let metric = IntGauge::new("analytics_active_workers", "Stream workers currently running")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref WORKER_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "analytics_worker_failures_total",
                "Stream workers terminated by a source failure",
            ),
            &["reason"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Analysis ====
    pub static ref DISPATCHES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("analytics_dispatches_total", "Backend calls by model and outcome"),
            &["model", "outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref BACKEND_LATENCY: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "analytics_backend_latency_seconds",
                "Latency of analysis backend calls",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["model"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Result store ====
    pub static ref RESULTS_PUBLISHED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("analytics_results_published_total", "Results published by severity"),
            &["severity"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref SUBSCRIBERS: IntGauge = {
        let metric = IntGauge::new("analytics_subscribers", "Connected real-time subscribers")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref SUBSCRIBER_DROPS: IntCounter = {
        let metric = IntCounter::new(
            "analytics_subscriber_drops_total",
            "Subscribers dropped after a failed delivery",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
