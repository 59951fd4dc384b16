// src/metrics.rs
//
// Ambient Prometheus exporter: `Lazy` statics over a global `Registry`,
// served by a small `tiny_http` thread, scoped to this gateway's counters.

use once_cell::sync::Lazy;
use prometheus::{CounterVec, Gauge, GaugeVec, IntCounterVec, Opts, Registry};
use std::thread;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RX_BYTES: Lazy<CounterVec> = Lazy::new(|| {
    let c = CounterVec::new(
        Opts::new("gateway_rx_bytes_total", "Bytes received from upstream, by protocol"),
        &["protocol"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TX_BYTES: Lazy<CounterVec> = Lazy::new(|| {
    let c = CounterVec::new(
        Opts::new("gateway_tx_bytes_total", "Bytes sent to HTTP clients"),
        &["service"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("gateway_drops_total", "Dropped units, by reason"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static POOL_BUFFERS: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        Opts::new("gateway_pool_buffers", "Buffer pool gauge, by kind"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static REORDER_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("gateway_reorder_events_total", "RTP reorder window events"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FCC_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("gateway_fcc_fallbacks_total", "FCC fallback-to-multicast events, by reason"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIVE_CLIENTS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("gateway_active_clients", "Currently streaming clients").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn inc_rx(protocol: &str, bytes: usize) {
    RX_BYTES.with_label_values(&[protocol]).inc_by(bytes as f64);
}

pub fn inc_tx(service: &str, bytes: usize) {
    TX_BYTES.with_label_values(&[service]).inc_by(bytes as f64);
}

pub fn inc_drop(reason: &str) {
    DROPS.with_label_values(&[reason]).inc();
}

pub fn set_pool_gauge(kind: &str, value: f64) {
    POOL_BUFFERS.with_label_values(&[kind]).set(value);
}

pub fn inc_reorder(kind: &str) {
    REORDER_EVENTS.with_label_values(&[kind]).inc();
}

pub fn inc_fcc_fallback(reason: &str) {
    FCC_FALLBACKS.with_label_values(&[reason]).inc();
}

pub fn set_active_clients(n: f64) {
    ACTIVE_CLIENTS.set(n);
}

/// Spawns the `/metrics` exporter thread: `/metrics` (Prometheus text
/// format), `/live`, `/ready`.
pub fn spawn_http(bind: String, shutdown: std::sync::Arc<crate::util::BarrierFlag>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("metrics-http".into())
        .spawn(move || {
            let server = match tiny_http::Server::http(&bind) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("metrics: failed to bind {}: {}", bind, e);
                    return;
                }
            };
            log::info!("metrics listening on {}", bind);
            loop {
                if shutdown.is_raised() {
                    break;
                }
                let req = match server.recv_timeout(std::time::Duration::from_millis(200)) {
                    Ok(Some(r)) => r,
                    Ok(None) => continue,
                    Err(_) => continue,
                };
                let (status, body, content_type) = match req.url() {
                    "/metrics" => {
                        use prometheus::Encoder;
                        let encoder = prometheus::TextEncoder::new();
                        let mut buf = Vec::new();
                        let _ = encoder.encode(&REGISTRY.gather(), &mut buf);
                        (200, buf, "text/plain; version=0.0.4")
                    }
                    "/live" => (200, b"ok".to_vec(), "text/plain"),
                    "/ready" => (200, b"ok".to_vec(), "text/plain"),
                    _ => (404, b"not found".to_vec(), "text/plain"),
                };
                let response = tiny_http::Response::from_data(body)
                    .with_status_code(status)
                    .with_header(
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
                            .unwrap(),
                    );
                let _ = req.respond(response);
            }
        })
        .expect("spawn metrics http")
}
