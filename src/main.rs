// src/main.rs
mod buffer;
mod config;
mod connection;
mod error;
mod fcc;
mod metrics;
mod net;
mod playlist;
mod reorder;
mod rtp;
mod rtsp;
mod sendqueue;
mod service;
mod status;
mod stream;
mod util;
mod worker;

use crate::config::AppConfig;
use crate::service::ServiceTable;
use crate::status::StatusTable;
use crate::util::BarrierFlag;
use crate::worker::WorkerConfig;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load config before the logger so the JSON-vs-plain formatting choice
    // (general.json_logs) is available at init time.
    let cfg = AppConfig::from_file(&cfg_path)?;

    if cfg.general.json_logs {
        let mut b =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(
                buf,
                "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts,
                record.level(),
                record.target(),
                record.args().to_string().replace('"', "'")
            )
        })
        .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("loaded config from {:?}", cfg_path);

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || {
            s.raise();
        })?;
    }

    let cfg = Arc::new(cfg);
    let services = Arc::new(ServiceTable::from_config(&cfg));
    let status = StatusTable::new(cfg.admission.as_ref().and_then(|a| a.maxclients).unwrap_or(4096));

    let metrics_handle = cfg.metrics.as_ref().map(|m| {
        crate::metrics::spawn_http(m.bind.clone(), shutdown.clone())
    });

    let worker_count = cfg.general.worker_threads.unwrap_or_else(num_workers_default);
    info!("starting {} worker thread(s) on {}", worker_count, cfg.listener.bind);

    let mut handles = Vec::with_capacity(worker_count);
    for worker_index in 0..worker_count {
        let wc = WorkerConfig {
            worker_index,
            cfg: cfg.clone(),
            services: services.clone(),
            status: status.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_index))
            .spawn(move || {
                if let Err(e) = worker::run(wc) {
                    error!("worker {} failed: {e:?}", worker_index);
                }
            })?;
        handles.push(handle);
    }

    for (i, h) in handles.into_iter().enumerate() {
        if h.join().is_err() {
            error!("worker {} thread panicked", i);
        }
    }

    if let Some(m) = &cfg.metrics {
        request_http_shutdown(&m.bind, &shutdown);
    }
    if let Some(h) = metrics_handle {
        let _ = h.join();
    }

    info!("clean shutdown");
    Ok(())
}

fn num_workers_default() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn request_http_shutdown(_addr: &str, shutdown: &Arc<BarrierFlag>) {
    // The metrics HTTP server polls `shutdown` directly (see
    // `metrics::spawn_http`) rather than needing a poke request; raising the
    // flag (already done via ctrlc or the worker-join path above) is enough
    // to unblock its `recv_timeout` loop within one tick.
    shutdown.raise();
}
