//! Prometheus counters of the grid and the `/metrics` endpoint.
use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

#[cfg(test)]
mod metrics_test;

lazy_static! {
    /// Line table events: hit, miss, stale_hit, invalidation, timeout, eviction
    pub static ref CACHE_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("grid_cache_events", "Cache line events"),
        &["node", "event"]
    )
    .expect("metric can not be created");

    pub static ref MESSAGES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("grid_messages_sent", "Protocol messages sent by type"),
        &["node", "type"]
    )
    .expect("metric can not be created");

    pub static ref MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("grid_messages_received", "Protocol messages received by type"),
        &["node", "type"]
    )
    .expect("metric can not be created");

    pub static ref LINES_CACHED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("grid_lines_cached", "Lines currently held in the line table"),
        &["node"]
    )
    .expect("metric can not be created");

    /// Duration of protocol exchanges (get, getx, del) in ms
    pub static ref EXCHANGE_LATENCY_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("grid_exchange_latency_ms", "Protocol exchange latency in ms")
            .buckets(exponential_buckets(0.25, 2.0, 14).expect("valid buckets")),
        &["node", "op"]
    )
    .expect("metric can not be created");

    pub static ref BACKUP_BATCH_SIZE: HistogramVec = HistogramVec::new(
        HistogramOpts::new("grid_backup_batch_size", "Records per flushed backup packet")
            .buckets(exponential_buckets(1.0, 2.0, 12).expect("valid buckets")),
        &["node"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub(crate) fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CACHE_EVENTS.clone()),
        Box::new(MESSAGES_SENT.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(LINES_CACHED.clone()),
        Box::new(EXCHANGE_LATENCY_MS.clone()),
        Box::new(BACKUP_BATCH_SIZE.clone()),
    ];
    for c in collectors {
        if let Err(e) = registry.register(c) {
            warn!("collector can not be registered: {:?}", e);
        }
    }
}

/// Serves `/metrics` on `port` until `shutdown` is cancelled.
pub async fn start_server(
    port: u16,
    shutdown: CancellationToken,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (addr, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            shutdown.cancelled().await;
        });
    info!("metrics server listening on {}", addr);
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather_text(&REGISTRY))
}

/// Text exposition of `registry`.
pub fn gather_text(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
