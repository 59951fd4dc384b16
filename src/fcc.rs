// src/fcc.rs
//
// Fast Channel Change state machine. Modeled as an explicit tagged-state enum
// with transitions driven by input events, never as loose booleans.

use crate::config::Fcc as FccCfg;
use crate::rtp::fcc_tag;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FccState {
    Init,
    Requested,
    UnicastPending,
    UnicastActive,
    McastRequested,
    McastActive { fallback_reason: Option<&'static str> },
}

pub enum FccEvent {
    /// Response/redirect control byte received (`0x83`).
    ServerResponse { redirect_to: Option<SocketAddr> },
    /// First RTP packet arrived from the announced unicast media port.
    FirstUnicastPacket,
    /// Sync notify control byte received (`0x84`).
    SyncNotify,
    /// A multicast packet whose sequence matches or exceeds the last
    /// forwarded unicast RTP sequence.
    McastCaughtUp,
    /// Periodic tick with the current monotonic millisecond clock.
    Tick(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccAction {
    None,
    SendRequest,
    ReopenAndResendRequest,
    JoinMulticast,
    StopUnicastForwarding,
    SendTerminate,
    TeardownUnicastSocket,
}

/// Drives one client's FCC rendezvous. Owns only the state + timers; socket
/// I/O is performed by the caller (`stream.rs`) in response to `FccAction`s.
pub struct FccSession {
    state: FccState,
    cfg: FccCfg,
    requested_at_ms: u64,
    unicast_active_since_ms: Option<u64>,
    sync_requested_at_ms: Option<u64>,
    last_unicast_seq: Option<u16>,
}

impl FccSession {
    pub fn new(cfg: FccCfg) -> Self {
        Self {
            state: FccState::Init,
            cfg,
            requested_at_ms: 0,
            unicast_active_since_ms: None,
            sync_requested_at_ms: None,
            last_unicast_seq: None,
        }
    }

    pub fn state(&self) -> &FccState {
        &self.state
    }

    pub fn start(&mut self, now_ms: u64) -> FccAction {
        self.state = FccState::Requested;
        self.requested_at_ms = now_ms;
        FccAction::SendRequest
    }

    pub fn note_unicast_seq(&mut self, seq: u16) {
        self.last_unicast_seq = Some(seq);
    }

    fn fallback_to_multicast(&mut self, reason: &'static str) -> FccAction {
        self.state = FccState::McastActive {
            fallback_reason: Some(reason),
        };
        FccAction::JoinMulticast
    }

    pub fn on_event(&mut self, event: FccEvent) -> FccAction {
        match (&self.state, event) {
            (FccState::Requested, FccEvent::ServerResponse { redirect_to: Some(_) }) => {
                // Self-transition with a side effect: reopen the socket
                // toward the new server and re-send the request.
                FccAction::ReopenAndResendRequest
            }
            (FccState::Requested, FccEvent::ServerResponse { redirect_to: None }) => {
                self.state = FccState::UnicastPending;
                FccAction::None
            }
            (FccState::UnicastPending, FccEvent::FirstUnicastPacket)
            | (FccState::Requested, FccEvent::FirstUnicastPacket) => {
                self.state = FccState::UnicastActive;
                self.unicast_active_since_ms = None;
                FccAction::None
            }
            (FccState::UnicastActive, FccEvent::SyncNotify) => {
                self.state = FccState::McastRequested;
                FccAction::JoinMulticast
            }
            (FccState::UnicastActive, FccEvent::Tick(now)) => {
                let since = self.unicast_active_since_ms.get_or_insert(now);
                if self.sync_requested_at_ms.is_none() {
                    self.sync_requested_at_ms = Some(*since);
                }
                if now.saturating_sub(self.sync_requested_at_ms.unwrap())
                    >= self.cfg.sync_wait_cap_sec * 1000
                {
                    self.state = FccState::McastRequested;
                    return FccAction::JoinMulticast;
                }
                FccAction::None
            }
            (FccState::McastRequested, FccEvent::McastCaughtUp) => {
                self.state = FccState::McastActive {
                    fallback_reason: None,
                };
                FccAction::StopUnicastForwarding
            }
            (FccState::Requested, FccEvent::Tick(now)) => {
                if now.saturating_sub(self.requested_at_ms) >= self.cfg.timeout_signaling_ms {
                    return self.fallback_to_multicast("Signaling timeout");
                }
                FccAction::None
            }
            (FccState::UnicastPending, FccEvent::Tick(now)) => {
                if now.saturating_sub(self.requested_at_ms) >= self.cfg.timeout_signaling_ms {
                    return self.fallback_to_multicast("First-unicast-packet timeout");
                }
                FccAction::None
            }
            (FccState::UnicastActive, FccEvent::Tick(_)) => FccAction::None,
            (_, FccEvent::Tick(_)) => FccAction::None,
            // Any state may fall back to multicast on stream interruption.
            _ => FccAction::None,
        }
    }

    /// Interruption timeout for an already-established unicast stream: falls
    /// back to multicast once the unicast feed has gone quiet too long.
    pub fn check_unicast_interruption(&mut self, last_packet_age_ms: u64) -> FccAction {
        if matches!(self.state, FccState::UnicastActive)
            && last_packet_age_ms >= self.cfg.timeout_unicast_sec * 1000
        {
            return self.fallback_to_multicast("Stream interruption");
        }
        FccAction::None
    }

    pub fn on_terminate(&mut self) -> FccAction {
        FccAction::SendTerminate
    }

    pub fn teardown_unicast(&mut self) -> FccAction {
        FccAction::TeardownUnicastSocket
    }

    /// Returns the control-byte tag to send for the given action, if any.
    pub fn control_tag_for(action: FccAction) -> Option<u8> {
        match action {
            FccAction::SendRequest | FccAction::ReopenAndResendRequest => Some(fcc_tag::REQUEST),
            FccAction::SendTerminate => Some(fcc_tag::TERMINATE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FccCfg {
        FccCfg {
            timeout_signaling_ms: 3000,
            timeout_unicast_sec: 5,
            sync_wait_cap_sec: 10,
        }
    }

    #[test]
    fn happy_path_reaches_mcast_active_without_fallback() {
        let mut s = FccSession::new(cfg());
        assert_eq!(s.start(0), FccAction::SendRequest);
        assert_eq!(*s.state(), FccState::Requested);
        s.on_event(FccEvent::ServerResponse { redirect_to: None });
        assert_eq!(*s.state(), FccState::UnicastPending);
        s.on_event(FccEvent::FirstUnicastPacket);
        assert_eq!(*s.state(), FccState::UnicastActive);
        let a = s.on_event(FccEvent::SyncNotify);
        assert_eq!(a, FccAction::JoinMulticast);
        assert_eq!(*s.state(), FccState::McastRequested);
        let a = s.on_event(FccEvent::McastCaughtUp);
        assert_eq!(a, FccAction::StopUnicastForwarding);
        assert!(matches!(
            s.state(),
            FccState::McastActive { fallback_reason: None }
        ));
    }

    #[test]
    fn redirect_resends_request_without_state_change() {
        let mut s = FccSession::new(cfg());
        s.start(0);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let a = s.on_event(FccEvent::ServerResponse {
            redirect_to: Some(addr),
        });
        assert_eq!(a, FccAction::ReopenAndResendRequest);
        assert_eq!(*s.state(), FccState::Requested);
    }

    #[test]
    fn signaling_timeout_falls_back_to_multicast() {
        let mut s = FccSession::new(cfg());
        s.start(0);
        let a = s.on_event(FccEvent::Tick(3000));
        assert_eq!(a, FccAction::JoinMulticast);
        match s.state() {
            FccState::McastActive { fallback_reason } => {
                assert_eq!(*fallback_reason, Some("Signaling timeout"));
            }
            other => panic!("expected McastActive, got {:?}", other),
        }
    }

    #[test]
    fn unicast_interruption_falls_back_independent_of_sync_timer() {
        let mut s = FccSession::new(cfg());
        s.start(0);
        s.on_event(FccEvent::ServerResponse { redirect_to: None });
        s.on_event(FccEvent::FirstUnicastPacket);
        let a = s.check_unicast_interruption(5000);
        assert_eq!(a, FccAction::JoinMulticast);
        match s.state() {
            FccState::McastActive { fallback_reason } => {
                assert_eq!(*fallback_reason, Some("Stream interruption"));
            }
            other => panic!("expected McastActive, got {:?}", other),
        }
    }
}
