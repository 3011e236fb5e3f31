use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Proxy request outcomes: relayed, rejected, upstream_failed
pub static PROXY_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("mcp_meter_proxy_requests_total", "Proxy requests by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static ADMISSIONS_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcp_meter_admissions_rejected_total",
            "Requests rejected before dispatch, by reason",
        ),
        &["reason"],
    )
    .unwrap()
});

pub static DISPATCHES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcp_meter_dispatches_total",
            "Upstream dispatches per server",
        ),
        &["server_id"],
    )
    .unwrap()
});

pub static UPSTREAM_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcp_meter_upstream_failures_total",
            "Dispatches that did not yield a 2xx reply",
        ),
        &["kind"],
    )
    .unwrap()
});

pub static CREDITS_DEBITED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mcp_meter_credits_debited_total",
            "Credits debited per server",
        ),
        &["server_id"],
    )
    .unwrap()
});

// Alert channels
pub static BILLING_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_billing_failures_total",
        "Successful upstream calls that could not be debited",
    )
    .unwrap()
});

pub static RECORDING_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_recording_failures_total",
        "Usage events that could not be appended",
    )
    .unwrap()
});

pub static DISPATCH_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "mcp_meter_dispatch_latency_seconds",
            "Upstream dispatch latency",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .unwrap()
});

pub static SERVERS_REGISTERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "mcp_meter_servers_registered_total",
        "Total number of upstream servers registered",
    )
    .unwrap()
});

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(PROXY_REQUESTS_TOTAL.clone()),
        Box::new(ADMISSIONS_REJECTED.clone()),
        Box::new(DISPATCHES_TOTAL.clone()),
        Box::new(UPSTREAM_FAILURES.clone()),
        Box::new(CREDITS_DEBITED.clone()),
        Box::new(BILLING_FAILURES.clone()),
        Box::new(RECORDING_FAILURES.clone()),
        Box::new(DISPATCH_LATENCY.clone()),
        Box::new(SERVERS_REGISTERED.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            // AlreadyReg when tests build several apps in one process
            if !matches!(e, prometheus::Error::AlreadyReg) {
                tracing::warn!("Failed to register metric: {}", e);
            }
        }
    }
}
