// src/net.rs
//
// Socket construction helpers: `socket2`-based multicast join, reuse-port,
// and nonblocking setup for the listener and per-service upstream sockets.

use anyhow::Context;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Builds a non-blocking UDP socket bound to the wildcard address and joined
/// to `group:port` (source-specific join when `source` is supplied).
pub fn build_mcast_socket(group: Ipv4Addr, port: u16, source: Option<Ipv4Addr>) -> anyhow::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket")?;
    sock.set_reuse_address(true).ok();
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    sock.bind(&bind_addr.into()).context("bind")?;

    match source {
        Some(src) => sock
            .join_ssm_v4(&src, &group)
            .context("join_ssm_v4")?,
        None => sock
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .context("join_multicast_v4")?,
    }

    sock.set_nonblocking(true).context("set_nonblocking")?;
    Ok(sock.into())
}

/// Drops and rejoins the same multicast group on the same socket, working
/// around IGMP state loss on flaky upstream switches. Takes a `mio`-wrapped
/// socket (the upstream sockets are registered with the worker's `Poll`) by
/// duplicating its raw fd into a throwaway `socket2::Socket`, the same
/// raw-fd idiom `configure_client_socket_mio` uses for option-setting on a
/// mio socket that otherwise offers no `try_clone`.
pub fn rejoin_multicast(
    sock: &mio::net::UdpSocket,
    group: Ipv4Addr,
    source: Option<Ipv4Addr>,
) -> std::io::Result<()> {
    use std::os::fd::{AsRawFd, FromRawFd};
    let dup_fd = unsafe { libc::dup(sock.as_raw_fd()) };
    if dup_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let sock2 = socket2::Socket::from(unsafe { UdpSocket::from_raw_fd(dup_fd) });
    match source {
        Some(src) => {
            let _ = sock2.leave_ssm_v4(&src, &group);
            sock2.join_ssm_v4(&src, &group)
        }
        None => {
            let _ = sock2.leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED);
            sock2.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        }
    }
}

/// Builds the SO_REUSEPORT listener each worker thread binds independently,
/// letting the kernel distribute accepted connections across workers.
pub fn build_reuseport_listener(bind: &str, reuse_port: bool) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = bind.parse().context("parse listener bind address")?;
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket")?;
    sock.set_reuse_address(true).ok();
    if reuse_port {
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        sock.set_reuse_port(true).ok();
    }
    sock.bind(&SockAddr::from(addr)).context("bind")?;
    sock.listen(1024).context("listen")?;
    sock.set_nonblocking(true).context("set_nonblocking")?;
    Ok(sock.into())
}

/// Applies the client socket options (`TCP_USER_TIMEOUT` ~10s, `SO_ZEROCOPY`
/// where supported) to an accepted `mio::net::TcpStream` by operating on its
/// raw fd; `TCP_NODELAY` is set directly by the caller via mio's own
/// `set_nodelay`.
pub fn configure_client_socket_mio(sock: &mio::net::TcpStream) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let fd = sock.as_raw_fd();
        unsafe {
            let timeout_ms: libc::c_uint = 10_000;
            let _ = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_USER_TIMEOUT,
                &timeout_ms as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
            );
            let on: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ZEROCOPY,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    let _ = sock;
    Ok(())
}

/// Opens the control-plane UDP socket toward an FCC rendezvous server.
pub fn build_fcc_socket(rendezvous: SocketAddr) -> anyhow::Result<UdpSocket> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("bind fcc socket")?;
    sock.connect(rendezvous).context("connect fcc rendezvous")?;
    sock.set_nonblocking(true).context("set_nonblocking")?;
    Ok(sock)
}

/// Resolves an `rtsp://host[:port]/path` URL and opens a blocking,
/// timeout-bounded TCP connection to its control port (default 554),
/// returning it set to non-blocking for the caller to hand to `mio`.
pub fn connect_rtsp(url: &str, timeout_ms: u64) -> anyhow::Result<TcpStream> {
    let parsed = url::Url::parse(url).context("parse rtsp url")?;
    let host = parsed.host_str().context("rtsp url missing host")?;
    let port = parsed.port().unwrap_or(554);
    let addr = (host, port)
        .to_socket_addrs()
        .context("resolve rtsp host")?
        .next()
        .context("rtsp host resolved to no addresses")?;
    let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms))
        .context("connect to rtsp server")?;
    stream.set_nonblocking(true).context("set_nonblocking")?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}
