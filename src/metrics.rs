//! Gateway metrics
//!
//! OpenTelemetry instruments for:
//! - Proxied requests (count, latency, request and response size)
//! - Reserved headers stripped from inbound requests
//!
//! Instruments are created once from a [`Meter`] and shared through the
//! application context. [`MetricsRegistry`] owns the meter provider and
//! renders everything recorded in the Prometheus text format for the
//! management listener.

use std::time::Instant;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, MeterProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Meter provider exporting into a Prometheus registry
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    provider: SdkMeterProvider,
}

impl MetricsRegistry {
    /// Create an empty registry with its meter provider
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .without_units()
            .without_counter_suffixes()
            .without_scope_info()
            .without_target_info()
            .build()
            .map_err(|e| Error::Config(format!("failed to create metrics exporter: {e}")))?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        Ok(Self { registry, provider })
    }

    /// Meter the gateway instruments are created on
    pub fn meter(&self) -> Meter {
        self.provider.meter("regate")
    }

    /// Everything recorded so far in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("failed to encode metrics: {e}")))
    }
}

/// Instruments recorded by the request pipeline
#[derive(Clone)]
pub struct GatewayMetrics {
    requests: Counter<u64>,
    request_duration: Histogram<f64>,
    request_size: Histogram<u64>,
    response_size: Histogram<u64>,
    blocked_headers_exposed: Gauge<u64>,
    blocked_headers_captured: Counter<u64>,
    requests_with_blocked_headers: Counter<u64>,
}

impl GatewayMetrics {
    /// Create the instruments on `meter`
    ///
    /// `expose_blocked_headers` is published once as a gauge.
    pub fn new(meter: &Meter, expose_blocked_headers: bool) -> Self {
        let metrics = Self {
            requests: meter
                .u64_counter("http_requests_total")
                .with_description("Total number of proxied HTTP requests")
                .with_unit("{requests}")
                .build(),
            request_duration: meter
                .f64_histogram("http_request_duration_seconds")
                .with_description("Duration of proxied HTTP requests in seconds")
                .with_unit("s")
                .build(),
            request_size: meter
                .u64_histogram("http_request_size_bytes")
                .with_description("Size of proxied HTTP request bodies")
                .with_unit("By")
                .build(),
            response_size: meter
                .u64_histogram("http_response_size_bytes")
                .with_description("Size of proxied HTTP response bodies")
                .with_unit("By")
                .build(),
            blocked_headers_exposed: meter
                .u64_gauge("blocked_headers_exposed")
                .with_description("Whether stripped reserved headers are exposed to policies")
                .build(),
            blocked_headers_captured: meter
                .u64_counter("blocked_headers_captured_total")
                .with_description("Total number of reserved headers stripped from requests")
                .with_unit("{headers}")
                .build(),
            requests_with_blocked_headers: meter
                .u64_counter("requests_with_blocked_headers_total")
                .with_description("Total number of requests that carried reserved headers")
                .with_unit("{requests}")
                .build(),
        };
        metrics
            .blocked_headers_exposed
            .record(u64::from(expose_blocked_headers), &[]);
        metrics
    }

    /// Record reserved headers stripped from one request
    pub fn record_blocked_headers(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.blocked_headers_captured.add(count as u64, &[]);
        self.requests_with_blocked_headers.add(1, &[]);
    }
}

/// Times one proxied request
pub struct RequestTimer {
    method: String,
    start: Instant,
}

impl RequestTimer {
    /// Start timing a request
    pub fn start(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            start: Instant::now(),
        }
    }

    /// Seconds since the timer started
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Record the finished request
    ///
    /// Negative `request_size` (unknown length) and unknown `response_size`
    /// are not recorded.
    pub fn complete(
        self,
        metrics: &GatewayMetrics,
        status: u16,
        url: &str,
        request_size: i64,
        response_size: Option<u64>,
    ) {
        let duration = self.elapsed_secs();
        let labels = [
            KeyValue::new("method", self.method),
            KeyValue::new("code", i64::from(status)),
            KeyValue::new("url", url.to_string()),
        ];

        metrics.requests.add(1, &labels);
        metrics.request_duration.record(duration, &labels);
        if let Ok(size) = u64::try_from(request_size) {
            metrics.request_size.record(size, &labels);
        }
        if let Some(size) = response_size {
            metrics.response_size.record(size, &labels);
        }
    }
}
