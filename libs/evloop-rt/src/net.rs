// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Connection/server/datagram construction helpers (spec §4.2).
//!
//! Address resolution and the blocking half of `connect`/`accept` retries
//! are driven the same way `transport::SocketTransport` drives I/O: a
//! non-blocking syscall first, then a reader/writer registration that
//! retries on readiness. Resolution itself (`get_address_info`) is the one
//! piece genuinely blocking end to end, so it is offloaded to the executor
//! pool exactly as spec §6 describes.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use crate::error::{EvLoopError, Result};
use crate::event_loop::EventThread;
use crate::future::Future as EvFuture;
use crate::task::Task;
use crate::transport::{self, DatagramProtocol, Server, StreamProtocol, Transport};

/// Backoff applied by the accept loop after a resource-exhaustion error
/// (`EMFILE`/`ENFILE`/`ENOBUFS`/`ENOMEM`), spec §4.2.
pub const ACCEPT_BACKOFF_SECONDS: f64 = 1.0;

fn resolve(host: String, port: u16) -> Result<Vec<SocketAddr>> {
    (host.as_str(), port)
        .to_socket_addrs()
        .map(Iterator::collect)
        .map_err(EvLoopError::from)
}

/// Waits for `fd` to become writable exactly once, then resolves. Used by
/// [`connect_stream`] to drive a non-blocking `connect()` to completion the
/// way spec §4.2's `socket_connect` describes.
fn wait_writable_once(event_loop: &Arc<EventThread>, fd: RawFd) -> EvFuture<()> {
    let waiter = EvFuture::new(event_loop.as_loop_handle());
    let done = waiter.clone();
    let el = event_loop.clone();
    event_loop.add_writer(
        fd,
        Arc::new(move || {
            el.remove_writer(fd);
            let _ = done.set_result_if_pending(());
            Ok(())
        }),
    );
    waiter
}

async fn connect_stream(event_loop: &Arc<EventThread>, addr: SocketAddr) -> Result<TcpStream> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock || is_in_progress(&err) => {
            wait_writable_once(event_loop, socket.as_raw_fd()).await?;
            if let Some(err) = socket.take_error()? {
                return Err(EvLoopError::Os(err));
            }
        }
        Err(err) => return Err(EvLoopError::Os(err)),
    }
    Ok(socket.into())
}

#[cfg(unix)]
fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn is_in_progress(_err: &io::Error) -> bool {
    false
}

/// Aggregates per-candidate connect failures into a single error the way
/// spec §4.2 describes ("collapses to a single error if every representation
/// matches").
fn aggregate_errors(errors: Vec<EvLoopError>) -> EvLoopError {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    if messages.windows(2).all(|w| w[0] == w[1]) {
        errors
            .into_iter()
            .next()
            .unwrap_or(EvLoopError::Os(io::Error::new(io::ErrorKind::Other, "no candidates")))
    } else {
        EvLoopError::Os(io::Error::new(io::ErrorKind::Other, messages.join("; ")))
    }
}

/// `create_connection_to` (spec §4.2): resolves `host:port` off-thread, then
/// tries each resolved candidate in order, returning the first transport
/// that connects.
#[must_use]
pub fn create_connection_to(
    event_loop: &Arc<EventThread>,
    host: String,
    port: u16,
    protocol: Arc<dyn StreamProtocol>,
) -> Task<Arc<dyn Transport>> {
    let el = event_loop.clone();
    event_loop.create_task(async move {
        let addrs = el
            .run_in_executor(move || resolve(host, port))
            .await?;
        if addrs.is_empty() {
            return Err(EvLoopError::ValueError("host resolved to no addresses"));
        }
        let mut errors = Vec::new();
        for addr in addrs {
            match connect_stream(&el, addr).await {
                Ok(stream) => return Ok(install_connection(el.clone(), stream, protocol.clone())),
                Err(err) => errors.push(err),
            }
        }
        Err(aggregate_errors(errors))
    })
}

/// `create_connection_with` (spec §4.2): skips resolution, requires an
/// already-connected stream socket.
#[must_use]
pub fn create_connection_with(
    event_loop: &Arc<EventThread>,
    stream: TcpStream,
    protocol: Arc<dyn StreamProtocol>,
) -> Arc<dyn Transport> {
    install_connection(event_loop.clone(), stream, protocol)
}

fn install_connection(
    event_loop: Arc<EventThread>,
    stream: TcpStream,
    protocol: Arc<dyn StreamProtocol>,
) -> Arc<dyn Transport> {
    // `make_socket_transport`'s waiter resolves synchronously (`install`
    // never suspends), so the result is available immediately.
    transport::make_socket_transport(event_loop, stream, protocol)
        .get_result()
        .expect("socket transport installation always resolves its waiter")
}

#[cfg(unix)]
fn apply_reuse_port(socket: &Socket, reuse_port: bool) -> Result<()> {
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_reuse_port(_socket: &Socket, _reuse_port: bool) -> Result<()> {
    Ok(())
}

fn bind_listener(addr: SocketAddr, backlog: i32, reuse_port: bool) -> Result<Socket> {
    if backlog <= 0 {
        return Err(EvLoopError::ValueError("backlog must be positive"));
    }
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    apply_reuse_port(&socket, reuse_port)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true).ok();
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket)
}

struct AcceptState {
    listener: TcpListener,
    event_loop: Arc<EventThread>,
    server: Arc<Server>,
    backlog: i32,
    protocol_factory: Box<dyn Fn() -> Arc<dyn StreamProtocol> + Send + Sync>,
}

fn arm_reader(state: Arc<AcceptState>) {
    let fd = state.listener.as_raw_fd();
    let cb_state = state.clone();
    state.event_loop.add_reader(
        fd,
        Arc::new(move || {
            accept_connection(&cb_state);
            Ok(())
        }),
    );
}

/// The accept loop (spec §4.2): up to `backlog` `accept()`s per wake-up;
/// resource-exhaustion errors suspend the reader for
/// [`ACCEPT_BACKOFF_SECONDS`] and reinstall it.
fn accept_connection(state: &Arc<AcceptState>) {
    if state.server.is_closed() {
        return;
    }
    for _ in 0..state.backlog.max(1) {
        match state.listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(true).ok();
                let protocol = (state.protocol_factory)();
                let event_loop = state.event_loop.clone();
                event_loop.create_task(async move {
                    transport::make_socket_transport(event_loop, stream, protocol).await?;
                    Ok::<(), EvLoopError>(())
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if is_resource_exhausted(&err) => {
                state.event_loop.remove_reader(state.listener.as_raw_fd());
                let reinstall = state.clone();
                state.event_loop.call_after(
                    ACCEPT_BACKOFF_SECONDS,
                    Box::new(move || {
                        arm_reader(reinstall.clone());
                        Ok(())
                    }),
                );
                break;
            }
            Err(err) => {
                state.event_loop.exception_reporter().report("accept", &err);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn is_resource_exhausted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(_err: &io::Error) -> bool {
    false
}

/// `create_server_to` (spec §4.2): resolves `host:port` then listens with
/// `SO_REUSEADDR`/`SO_REUSEPORT` as requested.
///
/// # Errors
///
/// Returns [`EvLoopError::ValueError`] for a non-positive `backlog` or an
/// unresolvable host, and [`EvLoopError::Os`] for bind/listen failures.
pub fn create_server_to(
    event_loop: &Arc<EventThread>,
    host: &str,
    port: u16,
    backlog: i32,
    reuse_port: bool,
    protocol_factory: impl Fn() -> Arc<dyn StreamProtocol> + Send + Sync + 'static,
) -> Result<Arc<Server>> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or(EvLoopError::ValueError("host resolved to no bindable address"))?;
    create_server_with_addr(event_loop, addr, backlog, reuse_port, protocol_factory)
}

/// `create_server_with` (spec §4.2): binds directly to a resolved address.
///
/// # Errors
///
/// Returns [`EvLoopError::ValueError`] for a non-positive `backlog`, and
/// [`EvLoopError::Os`] for bind/listen failures.
pub fn create_server_with_addr(
    event_loop: &Arc<EventThread>,
    addr: SocketAddr,
    backlog: i32,
    reuse_port: bool,
    protocol_factory: impl Fn() -> Arc<dyn StreamProtocol> + Send + Sync + 'static,
) -> Result<Arc<Server>> {
    let socket = bind_listener(addr, backlog, reuse_port)?;
    let local_addr = socket
        .local_addr()?
        .as_socket()
        .ok_or(EvLoopError::RuntimeError("bound socket carries no inet address"))?;
    let listener: TcpListener = socket.into();
    let server = Arc::new(Server::new(local_addr));
    let state = Arc::new(AcceptState {
        listener,
        event_loop: event_loop.clone(),
        server: server.clone(),
        backlog,
        protocol_factory: Box::new(protocol_factory),
    });
    arm_reader(state);
    Ok(server)
}

/// `create_datagram_connection_to` (spec §4.2, INET family): resolves then
/// binds a UDP socket, optionally connected to a fixed remote peer.
///
/// # Errors
///
/// Returns [`EvLoopError::ValueError`] for an unresolvable host and
/// [`EvLoopError::Os`] for bind/connect failures.
pub fn create_datagram_connection_to(
    event_loop: &Arc<EventThread>,
    local: Option<(&str, u16)>,
    remote: Option<(&str, u16)>,
    reuse_port: bool,
    broadcast: bool,
    protocol: Arc<dyn DatagramProtocol>,
) -> Result<Arc<dyn crate::transport::DatagramTransport>> {
    let local_addr = match local {
        Some((host, port)) => (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(EvLoopError::ValueError("local host resolved to no address"))?,
        None => "0.0.0.0:0".parse().expect("valid unspecified address"),
    };
    let domain = Domain::for_address(local_addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    apply_reuse_port(&socket, reuse_port)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&local_addr.into())?;
    if let Some((host, port)) = remote {
        let remote_addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(EvLoopError::ValueError("remote host resolved to no address"))?;
        socket.connect(&remote_addr.into())?;
    }
    let udp: UdpSocket = socket.into();
    // The waiter resolves synchronously (install never suspends), same as
    // `install_connection` above.
    transport::make_datagram_transport(event_loop.clone(), udp, protocol)
        .get_result()
}

/// `create_datagram_connection_with` (spec §4.2): adopts an already bound
/// (and, for a fixed peer, connected) UDP socket.
#[must_use]
pub fn create_datagram_connection_with(
    event_loop: &Arc<EventThread>,
    socket: UdpSocket,
    protocol: Arc<dyn DatagramProtocol>,
) -> Arc<crate::transport::UdpTransport> {
    crate::transport::UdpTransport::install(event_loop.clone(), socket, protocol)
}

#[cfg(unix)]
pub mod unix_datagram {
    //! UNIX-domain datagram sockets, the non-INET half of spec §4.2's
    //! `create_datagram_connection_to/with`. Framing/readiness follow the
    //! same reader-registration shape as [`super::UdpTransport`]; kept as a
    //! narrow standalone type rather than generalizing
    //! [`crate::transport::UdpTransport`] over the socket kind, since `std`
    //! gives `UnixDatagram` and `UdpSocket` no shared trait to abstract over
    //! without an extra layer of indirection this crate doesn't otherwise
    //! need.
    use std::os::unix::net::UnixDatagram;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use crate::error::{EvLoopError, Result};
    use crate::event_loop::EventThread;
    use std::io;
    use std::os::fd::AsRawFd;

    pub trait UnixDatagramProtocol: Send + Sync {
        fn datagram_received(&self, data: &[u8]);
        fn error_received(&self, error: EvLoopError) {
            let _ = error;
        }
    }

    pub struct UnixDatagramTransport {
        event_loop: Arc<EventThread>,
        fd: std::os::fd::RawFd,
        socket: UnixDatagram,
        protocol: Arc<dyn UnixDatagramProtocol>,
        closing: AtomicBool,
    }

    impl UnixDatagramTransport {
        #[must_use]
        pub fn install(
            event_loop: Arc<EventThread>,
            socket: UnixDatagram,
            protocol: Arc<dyn UnixDatagramProtocol>,
        ) -> Arc<Self> {
            socket.set_nonblocking(true).ok();
            let fd = socket.as_raw_fd();
            let this = Arc::new(Self {
                event_loop: event_loop.clone(),
                fd,
                socket,
                protocol,
                closing: AtomicBool::new(false),
            });
            let reader = this.clone();
            event_loop.add_reader(
                fd,
                Arc::new(move || {
                    reader.on_readable();
                    Ok(())
                }),
            );
            this
        }

        fn on_readable(self: &Arc<Self>) {
            let mut buf = [0u8; 64 * 1024];
            loop {
                match self.socket.recv(&mut buf) {
                    Ok(n) => self.protocol.datagram_received(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        self.protocol.error_received(EvLoopError::Os(err));
                        break;
                    }
                }
            }
        }

        pub fn send(&self, data: &[u8]) {
            if self.closing.load(AtomicOrdering::Acquire) {
                return;
            }
            if let Err(err) = self.socket.send(data) {
                self.protocol.error_received(EvLoopError::Os(err));
            }
        }

        pub fn close(&self) {
            if self.closing.swap(true, AtomicOrdering::AcqRel) {
                return;
            }
            self.event_loop.remove_reader(self.fd);
        }
    }

    /// # Errors
    ///
    /// Returns [`EvLoopError::Os`] on bind/connect failure.
    pub fn create_unix_datagram_connection(
        event_loop: &Arc<EventThread>,
        bind_path: Option<&Path>,
        connect_path: Option<&Path>,
        protocol: Arc<dyn UnixDatagramProtocol>,
    ) -> Result<Arc<UnixDatagramTransport>> {
        let socket = match bind_path {
            Some(path) => UnixDatagram::bind(path)?,
            None => UnixDatagram::unbound()?,
        };
        if let Some(path) = connect_path {
            socket.connect(path)?;
        }
        Ok(UnixDatagramTransport::install(event_loop.clone(), socket, protocol))
    }
}

#[cfg(not(unix))]
pub mod unix_datagram {
    //! UNIX-domain datagram sockets require a UNIX platform (spec §1).
    use crate::error::{EvLoopError, Result};

    /// # Errors
    ///
    /// Always returns [`EvLoopError::NotImplemented`].
    pub fn create_unix_datagram_connection() -> Result<()> {
        Err(EvLoopError::NotImplemented("unix datagram sockets require a UNIX platform"))
    }
}
