// src/config.rs
use serde::Deserialize;
use std::{fs, net::Ipv4Addr, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: General,
    pub listener: Listener,
    pub pool: Pool,
    pub queue_limit: QueueLimit,
    pub reorder: Reorder,
    pub fcc: Fcc,
    pub rtsp: Rtsp,
    #[serde(default)]
    pub multicast: Multicast,
    #[serde(default)]
    pub services: Vec<ServiceCfg>,
    #[serde(default)]
    pub admission: Option<Admission>,
    #[serde(default)]
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub worker_threads: Option<usize>, // default: num_cpus
    #[serde(default = "default_status_route")]
    pub status_route: String,
    #[serde(default)]
    pub udpxy_compat: bool,
}

fn default_status_route() -> String {
    "status".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    pub bind: String, // e.g. "0.0.0.0:8080"
    #[serde(default = "default_true")]
    pub reuse_port: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pool {
    pub max_packet_size: u32,  // e.g. 2048
    pub initial_buffers: usize,
    pub max_buffers: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
    #[serde(default = "default_control_reserve")]
    pub control_reserve: usize,
}

fn default_control_reserve() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueLimit {
    #[serde(default = "default_min_buffers")]
    pub min_buffers: usize,
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    #[serde(default = "default_slow_debounce_secs")]
    pub slow_debounce_secs: u64,
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
    #[serde(default = "default_flush_count")]
    pub flush_count: usize,
    #[serde(default = "default_flush_deadline_ms")]
    pub flush_deadline_ms: u64,
}

fn default_min_buffers() -> usize {
    4
}
fn default_ewma_alpha() -> f64 {
    0.2
}
fn default_slow_debounce_secs() -> u64 {
    3
}
fn default_flush_bytes() -> usize {
    64 * 1024
}
fn default_flush_count() -> usize {
    32
}
fn default_flush_deadline_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reorder {
    #[serde(default = "default_window")]
    pub window: usize, // W, default 16
    #[serde(default = "default_reorder_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_window() -> usize {
    16
}
fn default_reorder_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fcc {
    #[serde(default = "default_fcc_signaling_timeout_ms")]
    pub timeout_signaling_ms: u64,
    #[serde(default = "default_fcc_unicast_timeout_sec")]
    pub timeout_unicast_sec: u64,
    #[serde(default = "default_fcc_sync_wait_cap_sec")]
    pub sync_wait_cap_sec: u64,
}

fn default_fcc_signaling_timeout_ms() -> u64 {
    3000
}
fn default_fcc_unicast_timeout_sec() -> u64 {
    5
}
fn default_fcc_sync_wait_cap_sec() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rtsp {
    #[serde(default = "default_rtsp_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rtsp_keepalive_floor_ms")]
    pub keepalive_floor_ms: u64,
}

fn default_rtsp_connect_timeout_ms() -> u64 {
    5000
}
fn default_rtsp_keepalive_floor_ms() -> u64 {
    5000
}

/// Liveness/rejoin knobs for multicast and FCC-fallback upstreams, shared
/// across every service that ends up joining a group (direct or FCC fallback).
#[derive(Debug, Clone, Deserialize)]
pub struct Multicast {
    #[serde(default = "default_mcast_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub rejoin_interval_ms: Option<u64>,
}

impl Default for Multicast {
    fn default() -> Self {
        Self {
            timeout_ms: default_mcast_timeout_ms(),
            rejoin_interval_ms: None,
        }
    }
}

fn default_mcast_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCfg {
    pub path: String, // URL path this service is reachable at, e.g. "ch1"
    pub name: String,
    #[serde(default)]
    pub multicast: Option<McastServiceCfg>,
    #[serde(default)]
    pub rtsp: Option<RtspServiceCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McastServiceCfg {
    pub group: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub source: Option<Ipv4Addr>,
    #[serde(default)]
    pub fcc: Option<FccRendezvousCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FccRendezvousCfg {
    pub addr: String, // host:port of the FCC signaling server
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtspServiceCfg {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Admission {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub maxclients: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metrics {
    /// Bind address for the Prometheus exporter (e.g. "0.0.0.0:9100")
    pub bind: String,
}

impl AppConfig {
    pub fn from_file(p: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.max_packet_size < 512 || self.pool.max_packet_size > 65535 {
            anyhow::bail!("pool.max_packet_size must be in [512, 65535]");
        }
        if self.pool.low_watermark >= self.pool.high_watermark {
            anyhow::bail!("pool.low_watermark must be < pool.high_watermark");
        }
        if self.pool.max_buffers < self.pool.initial_buffers {
            anyhow::bail!("pool.max_buffers must be >= pool.initial_buffers");
        }
        if self.reorder.window == 0 {
            anyhow::bail!("reorder.window must be > 0");
        }
        if !(0.0..=1.0).contains(&self.queue_limit.ewma_alpha) {
            anyhow::bail!("queue_limit.ewma_alpha must be in [0, 1]");
        }
        for svc in &self.services {
            match (&svc.multicast, &svc.rtsp) {
                (None, None) => anyhow::bail!(
                    "service '{}' must configure either multicast or rtsp",
                    svc.path
                ),
                (Some(_), Some(_)) => anyhow::bail!(
                    "service '{}' must not configure both multicast and rtsp",
                    svc.path
                ),
                (Some(m), None) => {
                    if !m.group.is_multicast() {
                        anyhow::bail!(
                            "service '{}' multicast.group must be a multicast IPv4 address",
                            svc.path
                        );
                    }
                }
                (None, Some(r)) => {
                    if r.url.trim().is_empty() {
                        anyhow::bail!("service '{}' rtsp.url must be non-empty", svc.path);
                    }
                }
            }
        }
        if let Some(ref adm) = self.admission {
            if let Some(ref tok) = adm.bearer_token {
                if tok.trim().is_empty() {
                    anyhow::bail!("admission.bearer_token, if set, must be non-empty");
                }
            }
            // hostname-only admission (no token) is a valid configuration.
            let _ = &adm.hostname;
        }
        Ok(())
    }
}
