//! Blocking socket plumbing shared by the acceptor loops.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// How long a cancellable blocking loop waits before rechecking the running
/// flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Binds a TCP listener on every interface, with `SO_REUSEADDR` set before
/// bind. The listener is left in non-blocking mode for
/// [`accept_interruptible`].
pub(crate) fn bind_tcp_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Binds the UDP discovery socket with a short read timeout so its receive
/// loop can poll the running flag.
pub(crate) fn bind_udp_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;

    Ok(socket.into())
}

/// Accepts one client, waking every 100 ms to recheck `running`.
///
/// There is no portable way to cancel a blocked `accept`, so the listener is
/// polled in non-blocking mode instead. Returns `None` once `running` turns
/// false.
pub(crate) fn accept_interruptible(
    listener: &TcpListener,
    running: &AtomicBool,
) -> Option<(TcpStream, SocketAddr)> {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                // The accepted socket may inherit the listener's non-blocking
                // mode on some platforms.
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                return Some((stream, addr));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => {
                // Transient accept failure, retry at the next tick.
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    None
}
