//! Prometheus metrics for proxied requests

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome label recorded for requests relayed to a backend
pub const OUTCOME_PROXIED: &str = "proxied";

/// Per-handler request counters and latency
#[derive(Clone)]
pub struct ProxyMetrics {
    /// Requests by API service and outcome
    pub requests_total: CounterVec,
    /// Time until the response head was ready, by API service
    pub request_duration_seconds: HistogramVec,
    pub registry: Arc<Registry>,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new(
                "aggregator_proxy_requests_total",
                "Total proxied requests by API service and outcome",
            ),
            &["api_service", "outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "aggregator_proxy_request_duration_seconds",
                "Time to produce the response head in seconds",
            ),
            &["api_service"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        debug!("Proxy metrics registered");

        Ok(Self {
            requests_total,
            request_duration_seconds,
            registry,
        })
    }

    pub fn record(&self, api_service: &str, outcome: &str, elapsed: Duration) {
        self.requests_total
            .with_label_values(&[api_service, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[api_service])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition of all registered metrics
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
