// src/rtsp.rs
//
// RTSP 1.0 client session state machine. Naming/idiom cues taken from
// gst-plugins-rs's rtspsrc (CSeq matching, transport negotiation, interleaved
// framing) layered onto an explicit-tagged-state convention.

use crate::config::Rtsp as RtspCfg;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Idle,
    Connecting,
    OptionsSent,
    DescribeSent,
    SetupSent,
    PlaySent,
    Playing,
    Teardown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    InterleavedTcp { channel: u8 },
    Udp { client_rtp_port: u16, client_rtcp_port: u16 },
}

#[derive(Debug)]
pub struct RtspResponse<'a> {
    pub status: u16,
    pub cseq: Option<u32>,
    pub session_id: Option<&'a str>,
    pub session_timeout: Option<u64>,
    pub transport_header: Option<&'a str>,
}

/// Parses the minimal set of RTSP response headers the session cares about.
/// RTSP's status-line/header grammar is simple enough to hand-parse (same
/// approach gst-plugins-rs's rtspsrc takes); no dedicated crate is pulled in.
pub fn parse_response(raw: &str) -> Option<RtspResponse<'_>> {
    let mut lines = raw.split("\r\n");
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status: u16 = parts.next()?.parse().ok()?;

    let mut cseq = None;
    let mut session_id = None;
    let mut session_timeout = None;
    let mut transport_header = None;

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            let k = k.trim();
            let v = v.trim();
            match k.to_ascii_lowercase().as_str() {
                "cseq" => cseq = v.parse().ok(),
                "session" => {
                    if let Some((id, rest)) = v.split_once(';') {
                        session_id = Some(id);
                        if let Some(t) = rest.trim().strip_prefix("timeout=") {
                            session_timeout = t.parse().ok();
                        }
                    } else {
                        session_id = Some(v);
                    }
                }
                "transport" => transport_header = Some(v),
                _ => {}
            }
        }
    }

    Some(RtspResponse {
        status,
        cseq,
        session_id,
        session_timeout,
        transport_header,
    })
}

pub struct RtspSession {
    state: RtspState,
    cfg: RtspCfg,
    url: String,
    cseq: u32,
    outstanding_cseq: Option<u32>,
    session_id: Option<String>,
    transport: Option<Transport>,
    keepalive_interval_ms: u64,
    last_keepalive_ms: u64,
    playseek: Option<String>,
    teardown_in_flight: bool,
}

impl RtspSession {
    pub fn new(url: String, cfg: RtspCfg, playseek: Option<String>) -> Self {
        Self {
            state: RtspState::Idle,
            cfg,
            url,
            cseq: 0,
            outstanding_cseq: None,
            session_id: None,
            transport: None,
            keepalive_interval_ms: 0,
            last_keepalive_ms: 0,
            playseek,
            teardown_in_flight: false,
        }
    }

    pub fn state(&self) -> RtspState {
        self.state
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.outstanding_cseq = Some(self.cseq);
        self.cseq
    }

    pub fn build_options(&mut self) -> String {
        let cseq = self.next_cseq();
        self.state = RtspState::OptionsSent;
        format!("OPTIONS {} RTSP/1.0\r\nCSeq: {}\r\n\r\n", self.url, cseq)
    }

    pub fn build_describe(&mut self) -> String {
        let cseq = self.next_cseq();
        self.state = RtspState::DescribeSent;
        format!(
            "DESCRIBE {} RTSP/1.0\r\nCSeq: {}\r\nAccept: application/sdp\r\n\r\n",
            self.url, cseq
        )
    }

    pub fn build_setup(&mut self, prefer_interleaved: bool, client_ports: (u16, u16)) -> String {
        let cseq = self.next_cseq();
        self.state = RtspState::SetupSent;
        let mut req = String::new();
        let _ = write!(req, "SETUP {} RTSP/1.0\r\nCSeq: {}\r\n", self.url, cseq);
        if prefer_interleaved {
            let _ = write!(req, "Transport: RTP/AVP/TCP;interleaved=0-1\r\n");
        } else {
            let _ = write!(
                req,
                "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
                client_ports.0, client_ports.1
            );
        }
        if let Some(sid) = &self.session_id {
            let _ = write!(req, "Session: {}\r\n", sid);
        }
        req.push_str("\r\n");
        req
    }

    pub fn build_play(&mut self) -> String {
        let cseq = self.next_cseq();
        self.state = RtspState::PlaySent;
        let mut req = String::new();
        let _ = write!(req, "PLAY {} RTSP/1.0\r\nCSeq: {}\r\n", self.url, cseq);
        if let Some(sid) = &self.session_id {
            let _ = write!(req, "Session: {}\r\n", sid);
        }
        if let Some(ps) = &self.playseek {
            let _ = write!(req, "Range: npt={}\r\n", ps);
        }
        req.push_str("\r\n");
        req
    }

    pub fn build_keepalive(&mut self) -> String {
        let cseq = self.next_cseq();
        let mut req = String::new();
        let _ = write!(req, "OPTIONS {} RTSP/1.0\r\nCSeq: {}\r\n", self.url, cseq);
        if let Some(sid) = &self.session_id {
            let _ = write!(req, "Session: {}\r\n", sid);
        }
        req.push_str("\r\n");
        req
    }

    pub fn build_teardown(&mut self) -> String {
        let cseq = self.next_cseq();
        self.state = RtspState::Teardown;
        self.teardown_in_flight = true;
        let mut req = String::new();
        let _ = write!(req, "TEARDOWN {} RTSP/1.0\r\nCSeq: {}\r\n", self.url, cseq);
        if let Some(sid) = &self.session_id {
            let _ = write!(req, "Session: {}\r\n", sid);
        }
        req.push_str("\r\n");
        req
    }

    /// `true` if a TEARDOWN is outstanding and the stream context must defer
    /// destruction until the response (or a timeout) arrives.
    pub fn teardown_in_flight(&self) -> bool {
        self.teardown_in_flight
    }

    /// Feed a parsed response matching the outstanding request. Returns
    /// `false` if the CSeq doesn't match (stale/duplicate response, ignored).
    pub fn on_response(&mut self, resp: &RtspResponse<'_>, now_ms: u64) -> bool {
        if let (Some(expected), Some(got)) = (self.outstanding_cseq, resp.cseq) {
            if expected != got {
                return false;
            }
        }
        self.outstanding_cseq = None;

        if resp.status / 100 != 2 {
            return true;
        }

        if let Some(sid) = resp.session_id {
            self.session_id = Some(sid.to_string());
        }
        if let Some(timeout_sec) = resp.session_timeout {
            self.keepalive_interval_ms =
                (timeout_sec * 1000).max(self.cfg.keepalive_floor_ms) / 2;
        }

        match self.state {
            RtspState::OptionsSent => self.state = RtspState::Connecting,
            RtspState::DescribeSent => self.state = RtspState::Connecting,
            RtspState::SetupSent => {
                if let Some(t) = resp.transport_header {
                    self.transport = Some(if t.contains("interleaved") {
                        Transport::InterleavedTcp { channel: 0 }
                    } else {
                        Transport::Udp {
                            client_rtp_port: 0,
                            client_rtcp_port: 0,
                        }
                    });
                }
            }
            RtspState::PlaySent => {
                self.state = RtspState::Playing;
                self.last_keepalive_ms = now_ms;
            }
            RtspState::Teardown => {
                self.state = RtspState::Closed;
                self.teardown_in_flight = false;
            }
            _ => {}
        }
        true
    }

    pub fn transport(&self) -> Option<Transport> {
        self.transport
    }

    pub fn reorder_enabled(&self) -> bool {
        !matches!(self.transport, Some(Transport::InterleavedTcp { .. }))
    }

    /// True when it's time to send an OPTIONS keepalive (Playing + UDP +
    /// positive interval elapsed).
    pub fn should_keepalive(&self, now_ms: u64) -> bool {
        self.state == RtspState::Playing
            && matches!(self.transport, Some(Transport::Udp { .. }))
            && self.keepalive_interval_ms > 0
            && now_ms.saturating_sub(self.last_keepalive_ms) >= self.keepalive_interval_ms
    }

    pub fn note_keepalive_sent(&mut self, now_ms: u64) {
        self.last_keepalive_ms = now_ms;
    }
}

/// Demultiplexes interleaved `$<channel><len16>` framing from a TCP control
/// socket's read buffer. Returns `(channel, payload_len, consumed)` for a
/// complete frame, or `None` if more bytes are needed.
pub fn next_interleaved_frame(buf: &[u8]) -> Option<(u8, usize, usize)> {
    if buf.len() < 4 || buf[0] != b'$' {
        return None;
    }
    let channel = buf[1];
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    Some((channel, len, 4 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RtspCfg {
        RtspCfg {
            connect_timeout_ms: 5000,
            keepalive_floor_ms: 5000,
        }
    }

    #[test]
    fn full_handshake_reaches_playing() {
        let mut s = RtspSession::new("rtsp://host/live".into(), cfg(), None);
        let _ = s.build_options();
        assert!(s.on_response(
            &RtspResponse {
                status: 200,
                cseq: Some(1),
                session_id: None,
                session_timeout: None,
                transport_header: None,
            },
            0
        ));
        let _ = s.build_describe();
        assert!(s.on_response(
            &RtspResponse {
                status: 200,
                cseq: Some(2),
                session_id: None,
                session_timeout: None,
                transport_header: None,
            },
            0
        ));
        let _ = s.build_setup(true, (0, 0));
        assert!(s.on_response(
            &RtspResponse {
                status: 200,
                cseq: Some(3),
                session_id: Some("ABC123;timeout=60"),
                session_timeout: Some(60),
                transport_header: Some("RTP/AVP/TCP;interleaved=0-1"),
            },
            0
        ));
        assert_eq!(s.transport(), Some(Transport::InterleavedTcp { channel: 0 }));
        assert!(!s.reorder_enabled());
        let _ = s.build_play();
        assert!(s.on_response(
            &RtspResponse {
                status: 200,
                cseq: Some(4),
                session_id: None,
                session_timeout: None,
                transport_header: None,
            },
            1000
        ));
        assert_eq!(s.state(), RtspState::Playing);
    }

    #[test]
    fn stale_cseq_response_is_ignored() {
        let mut s = RtspSession::new("rtsp://host/live".into(), cfg(), None);
        let _ = s.build_options();
        let handled = s.on_response(
            &RtspResponse {
                status: 200,
                cseq: Some(999),
                session_id: None,
                session_timeout: None,
                transport_header: None,
            },
            0,
        );
        assert!(!handled);
        assert_eq!(s.state(), RtspState::OptionsSent);
    }

    #[test]
    fn teardown_is_asynchronous() {
        let mut s = RtspSession::new("rtsp://host/live".into(), cfg(), None);
        s.session_id = Some("X".into());
        let _ = s.build_teardown();
        assert!(s.teardown_in_flight());
        assert!(s.on_response(
            &RtspResponse {
                status: 200,
                cseq: Some(1),
                session_id: None,
                session_timeout: None,
                transport_header: None,
            },
            0
        ));
        assert!(!s.teardown_in_flight());
        assert_eq!(s.state(), RtspState::Closed);
    }

    #[test]
    fn interleaved_frame_parsing_waits_for_full_payload() {
        let mut buf = vec![b'$', 0u8];
        buf.extend_from_slice(&5u16.to_be_bytes());
        buf.extend_from_slice(b"abc");
        assert_eq!(next_interleaved_frame(&buf), None);
        buf.extend_from_slice(b"de");
        assert_eq!(next_interleaved_frame(&buf), Some((0, 5, 9)));
    }
}
