// src/playlist.rs
//
// M3U playlist surface (`GET /playlist.m3u`). Renders the configured service
// table as a minimal M3U passthrough with the right content type; this is
// not a full playlist transform engine.

use crate::service::ServiceTable;
use std::fmt::Write as _;

pub const CONTENT_TYPE: &str = "audio/x-mpegurl";

pub fn render(services: &ServiceTable, paths_in_order: &[String], base_url: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    for path in paths_in_order {
        if let Some(svc) = services.lookup(path) {
            let _ = writeln!(out, "#EXTINF:-1,{}", svc.name);
            let _ = writeln!(out, "{}/{}", base_url.trim_end_matches('/'), svc.path);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn table() -> ServiceTable {
        let toml = r#"
[general]
[listener]
bind = "0.0.0.0:8080"
[pool]
max_packet_size = 2048
initial_buffers = 16
max_buffers = 64
low_watermark = 4
high_watermark = 32
[queue_limit]
[reorder]
[fcc]
[rtsp]

[[services]]
path = "ch1"
name = "Channel 1"
[services.multicast]
group = "239.1.2.3"
port = 5000
"#;
        let cfg: AppConfig = toml::from_str(toml).unwrap();
        ServiceTable::from_config(&cfg)
    }

    #[test]
    fn renders_m3u_header_and_entries() {
        let t = table();
        let out = render(&t, &["ch1".to_string()], "http://gw:8080");
        assert!(out.starts_with("#EXTM3U\n"));
        assert!(out.contains("Channel 1"));
        assert!(out.contains("http://gw:8080/ch1"));
    }
}
