//! Non-blocking TCP socket plumbing.

use {
    socket2::{Domain, Protocol, Socket, Type},
    std::{
        io,
        net::{SocketAddr, TcpListener, TcpStream},
    },
};

/// Outcome of a non-blocking connect attempt.
#[derive(Debug)]
pub(crate) enum Connect {
    /// Handshake finished immediately (loopback fast path).
    Ready(TcpStream),
    /// Handshake in flight; completion is signalled by writability, and
    /// the verdict read via [`connect_result`].
    Pending(TcpStream),
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Start a non-blocking connect to `addr`.
pub(crate) fn connect_nonblocking(addr: SocketAddr) -> io::Result<Connect> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_tcp_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(Connect::Ready(socket.into())),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            Ok(Connect::Pending(socket.into()))
        }
        Err(e) => Err(e),
    }
}

/// Verdict of a non-blocking connect once epoll reports on the socket:
/// `Ok(true)` when established, `Ok(false)` while the handshake is
/// still in flight. `SO_ERROR` reads clean on an unfinished handshake
/// (epoll readiness can be stale when a descriptor number is recycled
/// within one event batch), so a clean read is confirmed against the
/// peer address.
pub(crate) fn connect_result(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Bind a non-blocking listener with `SO_REUSEADDR`, ready to accept.
pub(crate) fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Accept one pending connection; `Ok(None)` when none is queued.
///
/// The accepted stream is switched to non-blocking itself (accept does
/// not inherit the listener's mode on Linux) and gets `TCP_NODELAY`.
pub(crate) fn accept_nonblocking(
    listener: &TcpListener,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match listener.accept() {
        Ok((stream, addr)) => {
            stream.set_nonblocking(true)?;
            stream.set_nodelay(true)?;
            Ok(Some((stream, addr)))
        }
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
