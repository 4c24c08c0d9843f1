//! Metrics.
//!
//! Instruments are created through the global OpenTelemetry meter,
//! so they are no-ops until [`initialize_metrics`] installed a
//! provider. The provider exports to the default Prometheus registry,
//! which [`crate::webserver`] can serve.

use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
    KeyValue,
};
use prometheus::default_registry;

use crate::errors::{BspError, BspResult};
use crate::registry::PeerAddress;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> BspResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("bulksync")
        .build()
        .map_err(|err| BspError::Telemetry(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0, 30.0, 60.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| BspError::Telemetry(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Instruments recorded by one peer.
pub(crate) struct PeerMetrics {
    pub(crate) sync_duration: Histogram<f64>,
    pub(crate) messages_sent: Counter<u64>,
    pub(crate) messages_delivered: Counter<u64>,
    pub(crate) supersteps: Counter<u64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl PeerMetrics {
    pub(crate) fn new(peer: &PeerAddress) -> Self {
        let meter = global::meter("bulksync");
        Self {
            sync_duration: meter
                .f64_histogram("sync_duration_seconds")
                .with_description("time a peer spent waiting at a barrier")
                .init(),
            messages_sent: meter
                .u64_counter("messages_sent")
                .with_description("messages handed to the barrier")
                .init(),
            messages_delivered: meter
                .u64_counter("messages_delivered")
                .with_description("messages installed in a mailbox")
                .init(),
            supersteps: meter
                .u64_counter("supersteps")
                .with_description("barriers crossed")
                .init(),
            labels: vec![KeyValue::new("peer", peer.name().to_string())],
        }
    }
}
