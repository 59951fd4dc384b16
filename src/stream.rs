// src/stream.rs
//
// Stream context: composes the reorder window, FCC session, and RTSP session
// for one client, and owns its upstream sockets. Follows a
// subsystem-composition idiom (owns sockets, registers fds, per-tick
// responsibilities) scaled to per-client granularity.

use crate::fcc::{FccAction, FccEvent, FccSession};
use crate::reorder::ReorderWindow;
use crate::rtsp::RtspSession;
use crate::service::Service;
use mio::net::{TcpStream, UdpSocket};
use std::net::Ipv4Addr;

pub enum Upstream {
    DirectMulticast {
        socket: UdpSocket,
    },
    Fcc {
        session: FccSession,
        unicast_socket: Option<UdpSocket>,
        multicast_socket: Option<UdpSocket>,
    },
    Rtsp {
        session: RtspSession,
        control_socket: TcpStream,
        /// Bytes read from the control socket not yet resolved into either a
        /// complete `$`-framed media packet or a complete RTSP response.
        frame_buf: Vec<u8>,
        /// Position in the OPTIONS -> DESCRIBE -> SETUP -> PLAY handshake;
        /// `RtspState` alone can't distinguish the OPTIONS-done and
        /// DESCRIBE-done points since both land in `RtspState::Connecting`.
        handshake_step: u8,
    },
}

pub struct StreamContext {
    pub upstream: Upstream,
    pub reorder: ReorderWindow,
    pub bytes_sent: u64,
    pub bytes_sent_last_second: u64,
    pub last_bandwidth_update_ms: u64,
    pub last_mcast_packet_ms: u64,
    pub last_rejoin_ms: u64,
    pub last_rtsp_keepalive_ms: u64,
    pub mcast_rejoin_interval_ms: Option<u64>,
    pub mcast_timeout_ms: u64,
    /// Group/port/source to rejoin on a timer, or to join as the FCC
    /// multicast-fallback socket; `None` for RTSP (no multicast fallback).
    pub mcast_target: Option<(Ipv4Addr, u16, Option<Ipv4Addr>)>,
    /// Slab key (in the worker's upstream-token table) of this context's
    /// primary upstream socket; filled in by the caller right after
    /// registering it with `Poll`.
    pub primary_token_key: usize,
    /// Slab key of the secondary (FCC multicast-fallback) socket, once
    /// opened.
    pub secondary_token_key: Option<usize>,
}

impl StreamContext {
    pub fn new_direct_multicast(
        socket: UdpSocket,
        mcast_target: (Ipv4Addr, u16, Option<Ipv4Addr>),
        mcast_rejoin_interval_ms: Option<u64>,
        reorder_window: usize,
        reorder_timeout_ms: u64,
        mcast_timeout_ms: u64,
    ) -> Self {
        Self {
            upstream: Upstream::DirectMulticast { socket },
            reorder: ReorderWindow::new(reorder_window, reorder_timeout_ms),
            bytes_sent: 0,
            bytes_sent_last_second: 0,
            last_bandwidth_update_ms: 0,
            last_mcast_packet_ms: 0,
            last_rejoin_ms: 0,
            last_rtsp_keepalive_ms: 0,
            mcast_rejoin_interval_ms,
            mcast_timeout_ms,
            mcast_target: Some(mcast_target),
            primary_token_key: usize::MAX,
            secondary_token_key: None,
        }
    }

    pub fn new_fcc(
        fcc: FccSession,
        unicast_socket: UdpSocket,
        mcast_target: (Ipv4Addr, u16, Option<Ipv4Addr>),
        mcast_rejoin_interval_ms: Option<u64>,
        reorder_window: usize,
        reorder_timeout_ms: u64,
        mcast_timeout_ms: u64,
    ) -> Self {
        Self {
            upstream: Upstream::Fcc {
                session: fcc,
                unicast_socket: Some(unicast_socket),
                multicast_socket: None,
            },
            reorder: ReorderWindow::new(reorder_window, reorder_timeout_ms),
            bytes_sent: 0,
            bytes_sent_last_second: 0,
            last_bandwidth_update_ms: 0,
            last_mcast_packet_ms: 0,
            last_rejoin_ms: 0,
            last_rtsp_keepalive_ms: 0,
            mcast_rejoin_interval_ms,
            mcast_timeout_ms,
            mcast_target: Some(mcast_target),
            primary_token_key: usize::MAX,
            secondary_token_key: None,
        }
    }

    pub fn new_rtsp(
        rtsp: RtspSession,
        control_socket: TcpStream,
        reorder_window: usize,
        reorder_timeout_ms: u64,
        mcast_timeout_ms: u64,
    ) -> Self {
        let mut reorder = ReorderWindow::new(reorder_window, reorder_timeout_ms);
        reorder.enabled = rtsp.reorder_enabled();
        Self {
            upstream: Upstream::Rtsp {
                session: rtsp,
                control_socket,
                frame_buf: Vec::with_capacity(4096),
                handshake_step: 0,
            },
            reorder,
            bytes_sent: 0,
            bytes_sent_last_second: 0,
            last_bandwidth_update_ms: 0,
            last_mcast_packet_ms: 0,
            last_rejoin_ms: 0,
            last_rtsp_keepalive_ms: 0,
            mcast_rejoin_interval_ms: None,
            mcast_timeout_ms,
            mcast_target: None,
            primary_token_key: usize::MAX,
            secondary_token_key: None,
        }
    }

    /// Called once per worker-loop iteration. The upstream-timeout and FCC
    /// timeout run independently, never nested. Returns the FCC actions the
    /// caller must apply (control bytes to send, sockets to open/close);
    /// rejoin and RTSP-keepalive timers are surfaced separately via
    /// `mcast_rejoin_due`/`rtsp_keepalive_due` since those need no FCC-style
    /// action enum, just a socket write/rejoin the caller already knows how
    /// to do.
    pub fn tick(&mut self, now_ms: u64) -> Vec<FccAction> {
        let mut actions = Vec::new();

        if let Upstream::Fcc { session, .. } = &mut self.upstream {
            actions.push(session.on_event(FccEvent::Tick(now_ms)));
            let age = now_ms.saturating_sub(self.last_mcast_packet_ms);
            actions.push(session.check_unicast_interruption(age));
        }

        for emitted in self.reorder.tick(now_ms).drain(..) {
            self.note_bytes_sent(emitted.len() as u64);
        }

        if now_ms.saturating_sub(self.last_bandwidth_update_ms) >= 1000 {
            self.bytes_sent_last_second = 0;
            self.last_bandwidth_update_ms = now_ms;
        }

        actions.retain(|a| *a != FccAction::None);
        actions
    }

    /// True (at most once per interval) when the multicast group should be
    /// re-joined on its current socket to recover from IGMP state loss on a
    /// flaky upstream switch. Updates the internal timer as a side effect.
    pub fn mcast_rejoin_due(&mut self, now_ms: u64) -> bool {
        let Some(interval) = self.mcast_rejoin_interval_ms else {
            return false;
        };
        if now_ms.saturating_sub(self.last_rejoin_ms) < interval {
            return false;
        }
        self.last_rejoin_ms = now_ms;
        true
    }

    /// True (at most once per interval) when an RTSP OPTIONS keepalive is due
    /// on a UDP-transport session. Marks the keepalive as sent as a side
    /// effect; the caller still has to build and write it.
    pub fn rtsp_keepalive_due(&mut self, now_ms: u64) -> bool {
        let Upstream::Rtsp { session, .. } = &mut self.upstream else {
            return false;
        };
        if !session.should_keepalive(now_ms) {
            return false;
        }
        session.note_keepalive_sent(now_ms);
        true
    }

    pub fn note_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
        self.bytes_sent_last_second += n;
    }
}

/// Chooses the upstream path for a routed request.
pub enum UpstreamChoice<'a> {
    Rtsp { url: &'a str },
    Fcc { rendezvous: &'a str },
    DirectMulticast,
}

pub fn choose_upstream(service: &Service) -> UpstreamChoice<'_> {
    if let Some(rtsp) = &service.rtsp {
        return UpstreamChoice::Rtsp { url: &rtsp.url };
    }
    if let Some(mcast) = &service.multicast {
        if let Some(fcc) = &mcast.fcc {
            return UpstreamChoice::Fcc {
                rendezvous: &fcc.addr,
            };
        }
    }
    UpstreamChoice::DirectMulticast
}
