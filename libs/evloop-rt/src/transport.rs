// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Transport/Protocol contracts and construction signatures (spec §6).
//!
//! Concrete transport bodies are out of scope here: the source's duck-typed
//! protocol objects become a narrow [`Protocol`] trait, and the factory
//! functions build a [`SocketTransport`] that drives that trait over a raw
//! fd using the owning [`EventThread`]'s reader/writer registration — the
//! byte-level SSL/pipe/subprocess state machines themselves are not
//! reproduced (spec.md §1's "consumed only" framing for this surface).
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::{EvLoopError, Result};
use crate::event_loop::EventThread;
use crate::future::Future as EvFuture;

/// The contract a transport expects of its protocol (spec §6): connection
/// lifecycle plus flow-control backpressure notifications.
pub trait Protocol: Send + Sync {
    fn connection_made(&self, transport: Arc<dyn Transport>);
    fn connection_lost(&self, error: Option<EvLoopError>);
    fn pause_writing(&self) {}
    fn resume_writing(&self) {}
}

/// The stream extension of [`Protocol`]: delivers bytes as they arrive.
pub trait StreamProtocol: Protocol {
    fn data_received(&self, data: &[u8]);
    fn eof_received(&self) -> bool {
        false
    }
}

/// A transport as observed by its [`Protocol`]: write scheduling and
/// half-close/close control.
pub trait Transport: Send + Sync {
    fn write(&self, data: &[u8]);
    fn write_eof(&self) {}
    fn can_write_eof(&self) -> bool {
        false
    }
    fn close(&self);
    fn is_closing(&self) -> bool;
    fn get_extra_info(&self, name: &str) -> Option<String>;
}

/// High/low watermarks (in buffered bytes) at which a transport calls
/// `pause_writing`/`resume_writing` on its protocol.
const WRITE_HIGH_WATER: usize = 64 * 1024;
const WRITE_LOW_WATER: usize = 16 * 1024;

struct SocketTransportState {
    stream: TcpStream,
    write_buffer: VecDeque<u8>,
    writer_registered: bool,
    paused: bool,
}

/// Drives a [`Protocol`] over a connected, non-blocking TCP-shaped stream:
/// registers a reader that calls `data_received`, and a writer (armed only
/// while output is buffered) that drains `write_buffer`.
pub struct SocketTransport {
    event_loop: Arc<EventThread>,
    fd: RawFd,
    protocol: Arc<dyn StreamProtocol>,
    state: Mutex<SocketTransportState>,
    closing: AtomicBool,
    self_weak: OnceLock<Weak<SocketTransport>>,
}

impl SocketTransport {
    fn install(
        event_loop: Arc<EventThread>,
        stream: TcpStream,
        protocol: Arc<dyn StreamProtocol>,
    ) -> Arc<Self> {
        stream.set_nonblocking(true).ok();
        let fd = stream.as_raw_fd();
        let this = Arc::new_cyclic(|weak| {
            let _ = weak;
            Self {
                event_loop: event_loop.clone(),
                fd,
                protocol,
                state: Mutex::new(SocketTransportState {
                    stream,
                    write_buffer: VecDeque::new(),
                    writer_registered: false,
                    paused: false,
                }),
                closing: AtomicBool::new(false),
                self_weak: OnceLock::new(),
            }
        });
        let _ = this.self_weak.set(Arc::downgrade(&this));
        let reader = this.clone();
        event_loop.add_reader(
            fd,
            Arc::new(move || {
                reader.on_readable();
                Ok(())
            }),
        );
        this.protocol.connection_made(this.clone() as Arc<dyn Transport>);
        this
    }

    fn on_readable(self: &Arc<Self>) {
        let mut buf = [0u8; 8192];
        let read = {
            let mut state = self.state.lock().unwrap();
            state.stream.read(&mut buf)
        };
        match read {
            Ok(0) => {
                let eof_keeps_open = self.protocol.eof_received();
                if !eof_keeps_open {
                    self.close();
                }
            }
            Ok(n) => self.protocol.data_received(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                self.event_loop
                    .exception_reporter()
                    .report("socket transport read", &err);
                self.abort(Some(EvLoopError::Os(err)));
            }
        }
    }

    fn on_writable(self: &Arc<Self>) {
        let (drained_to_empty, should_resume) = {
            let mut state = self.state.lock().unwrap();
            loop {
                if state.write_buffer.is_empty() {
                    break;
                }
                let chunk: Vec<u8> = state.write_buffer.iter().copied().collect();
                match state.stream.write(&chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        state.write_buffer.drain(..n);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            let resume = state.paused && state.write_buffer.len() <= WRITE_LOW_WATER;
            if resume {
                state.paused = false;
            }
            (state.write_buffer.is_empty(), resume)
        };
        if should_resume {
            self.protocol.resume_writing();
        }
        if drained_to_empty {
            let mut state = self.state.lock().unwrap();
            if state.writer_registered {
                self.event_loop.remove_writer(self.fd);
                state.writer_registered = false;
            }
        }
    }

    fn abort(self: &Arc<Self>, error: Option<EvLoopError>) {
        if self.closing.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.event_loop.remove_reader(self.fd);
        self.event_loop.remove_writer(self.fd);
        self.protocol.connection_lost(error);
    }
}

impl Transport for SocketTransport {
    fn write(&self, data: &[u8]) {
        if self.closing.load(AtomicOrdering::Acquire) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.write_buffer.is_empty() {
            match state.stream.write(data) {
                Ok(n) if n == data.len() => return,
                Ok(n) => state.write_buffer.extend(&data[n..]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    state.write_buffer.extend(data);
                }
                Err(_) => return,
            }
        } else {
            state.write_buffer.extend(data);
        }

        if !state.writer_registered {
            state.writer_registered = true;
            if let Some(this) = self.self_weak.get().and_then(Weak::upgrade) {
                self.event_loop.add_writer(
                    self.fd,
                    Arc::new(move || {
                        this.on_writable();
                        Ok(())
                    }),
                );
            }
        }
        if state.write_buffer.len() > WRITE_HIGH_WATER && !state.paused {
            state.paused = true;
            drop(state);
            self.protocol.pause_writing();
        }
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    fn write_eof(&self) {
        let state = self.state.lock().unwrap();
        let _ = state.stream.shutdown(std::net::Shutdown::Write);
    }

    fn close(&self) {
        if self.closing.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.event_loop.remove_reader(self.fd);
        self.event_loop.remove_writer(self.fd);
        let state = self.state.lock().unwrap();
        let _ = state.stream.shutdown(std::net::Shutdown::Both);
        drop(state);
        self.protocol.connection_lost(None);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(AtomicOrdering::Acquire)
    }

    fn get_extra_info(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        match name {
            "peername" => state.stream.peer_addr().ok().map(|a| a.to_string()),
            "sockname" => state.stream.local_addr().ok().map(|a| a.to_string()),
            _ => None,
        }
    }
}

/// The datagram extension of [`Protocol`] (spec §6): delivers one packet at
/// a time together with the address it arrived from.
pub trait DatagramProtocol: Send + Sync {
    fn connection_made(&self, transport: Arc<dyn DatagramTransport>);
    fn connection_lost(&self, error: Option<EvLoopError>) {
        let _ = error;
    }
    fn datagram_received(&self, data: &[u8], addr: std::net::SocketAddr);
    fn error_received(&self, error: EvLoopError) {
        let _ = error;
    }
}

/// A datagram transport as observed by its [`DatagramProtocol`].
pub trait DatagramTransport: Send + Sync {
    fn send_to(&self, data: &[u8], addr: std::net::SocketAddr);
    fn close(&self);
    fn is_closing(&self) -> bool;
}

/// Drives a [`DatagramProtocol`] over a bound, non-blocking UDP socket:
/// registers a reader that calls `datagram_received` once per packet (spec
/// §4.2's `create_datagram_connection_to/with`).
pub struct UdpTransport {
    event_loop: Arc<EventThread>,
    fd: RawFd,
    socket: std::net::UdpSocket,
    protocol: Arc<dyn DatagramProtocol>,
    closing: AtomicBool,
}

impl UdpTransport {
    #[must_use]
    pub fn install(
        event_loop: Arc<EventThread>,
        socket: std::net::UdpSocket,
        protocol: Arc<dyn DatagramProtocol>,
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
        this.protocol.connection_made(this.clone() as Arc<dyn DatagramTransport>);
        this
    }

    fn on_readable(self: &Arc<Self>) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, addr)) => self.protocol.datagram_received(&buf[..n], addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.protocol.error_received(EvLoopError::Os(err));
                    break;
                }
            }
        }
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&self, data: &[u8], addr: std::net::SocketAddr) {
        if self.closing.load(AtomicOrdering::Acquire) {
            return;
        }
        if let Err(err) = self.socket.send_to(data, addr) {
            self.protocol.error_received(EvLoopError::Os(err));
        }
    }

    fn close(&self) {
        if self.closing.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.event_loop.remove_reader(self.fd);
        self.protocol.connection_lost(None);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(AtomicOrdering::Acquire)
    }
}

/// A listening socket plus the server-side bookkeeping used by the accept
/// loop (spec §4.2).
pub struct Server {
    pub local_addr: std::net::SocketAddr,
    closed: AtomicBool,
}

impl Server {
    #[must_use]
    pub fn new(local_addr: std::net::SocketAddr) -> Self {
        Self { local_addr, closed: AtomicBool::new(false) }
    }

    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}

/// Builds a transport over an already-connected stream socket (spec §6:
/// `make_socket_transport`). The returned future resolves once
/// `connection_made` has run, with the transport handle itself as the
/// result value.
#[must_use]
pub fn make_socket_transport(
    event_loop: Arc<EventThread>,
    stream: TcpStream,
    protocol: Arc<dyn StreamProtocol>,
) -> EvFuture<Arc<dyn Transport>> {
    let waiter = EvFuture::new(event_loop.as_loop_handle());
    let ready = waiter.clone();
    let transport = SocketTransport::install(event_loop, stream, protocol);
    let _ = ready.set_result(transport as Arc<dyn Transport>);
    waiter
}

/// TLS is out of scope for this crate (spec.md §1): always fails.
///
/// # Errors
///
/// Always returns [`EvLoopError::NotImplemented`].
pub fn make_ssl_transport() -> Result<()> {
    Err(EvLoopError::NotImplemented("TLS transports are not implemented"))
}

/// Builds a transport over an already-bound UDP socket (spec §6:
/// `make_datagram_transport`). The returned future resolves once
/// `connection_made` has run, with the transport handle as the result
/// value; see [`crate::net`] for the resolve-then-bind/connect builder that
/// calls this.
#[must_use]
pub fn make_datagram_transport(
    event_loop: Arc<EventThread>,
    socket: std::net::UdpSocket,
    protocol: Arc<dyn DatagramProtocol>,
) -> EvFuture<Arc<dyn DatagramTransport>> {
    let waiter = EvFuture::new(event_loop.as_loop_handle());
    let ready = waiter.clone();
    let transport = UdpTransport::install(event_loop, socket, protocol);
    let _ = ready.set_result(transport as Arc<dyn DatagramTransport>);
    waiter
}

#[cfg(unix)]
fn set_nonblocking(fd: RawFd) {
    // SAFETY: `fd` is owned by the caller for the duration of this call and
    // not shared with another thread until after this returns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Adapts a pipe-shaped read end (a subprocess's stdout/stderr, spec §4.2's
/// `connect_read_pipe`) to a [`StreamProtocol`] the same way [`SocketTransport`]
/// adapts a socket: registers a reader that reads until `WouldBlock`.
///
/// Implements [`Transport`] so it can be handed to `connection_made`, but a
/// read end has no write direction: `write`/`write_eof` are no-ops and
/// `can_write_eof` is `false`.
#[cfg(unix)]
pub struct UnixReadPipeTransport {
    event_loop: Arc<EventThread>,
    fd: RawFd,
    file: Mutex<std::fs::File>,
    protocol: Arc<dyn StreamProtocol>,
    closing: AtomicBool,
}

#[cfg(unix)]
impl UnixReadPipeTransport {
    #[must_use]
    pub fn install(
        event_loop: Arc<EventThread>,
        file: std::fs::File,
        protocol: Arc<dyn StreamProtocol>,
    ) -> Arc<Self> {
        let fd = file.as_raw_fd();
        set_nonblocking(fd);
        let this = Arc::new(Self {
            event_loop: event_loop.clone(),
            fd,
            file: Mutex::new(file),
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
        this.protocol.connection_made(this.clone() as Arc<dyn Transport>);
        this
    }

    fn on_readable(self: &Arc<Self>) {
        let mut buf = [0u8; 8192];
        loop {
            let read = self.file.lock().unwrap().read(&mut buf);
            match read {
                Ok(0) => {
                    let eof_keeps_open = self.protocol.eof_received();
                    if !eof_keeps_open {
                        self.close();
                    }
                    break;
                }
                Ok(n) => self.protocol.data_received(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.event_loop
                        .exception_reporter()
                        .report("pipe read", &err);
                    self.abort(Some(EvLoopError::Os(err)));
                    break;
                }
            }
        }
    }

    fn abort(self: &Arc<Self>, error: Option<EvLoopError>) {
        if self.closing.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.event_loop.remove_reader(self.fd);
        self.protocol.connection_lost(error);
    }
}

#[cfg(unix)]
impl Transport for UnixReadPipeTransport {
    fn write(&self, _data: &[u8]) {}

    fn can_write_eof(&self) -> bool {
        false
    }

    fn close(&self) {
        self.abort(None);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(AtomicOrdering::Acquire)
    }

    fn get_extra_info(&self, _name: &str) -> Option<String> {
        None
    }
}

struct UnixWritePipeState {
    file: std::fs::File,
    write_buffer: VecDeque<u8>,
    writer_registered: bool,
    paused: bool,
}

/// Adapts a pipe-shaped write end (a subprocess's stdin, spec §4.2's
/// `connect_write_pipe`) to a [`Protocol`]: buffers past `WouldBlock` and
/// drains via a writer registration, mirroring [`SocketTransport::write`].
#[cfg(unix)]
pub struct UnixWritePipeTransport {
    event_loop: Arc<EventThread>,
    fd: RawFd,
    protocol: Arc<dyn Protocol>,
    state: Mutex<UnixWritePipeState>,
    closing: AtomicBool,
    self_weak: OnceLock<Weak<UnixWritePipeTransport>>,
}

#[cfg(unix)]
impl UnixWritePipeTransport {
    #[must_use]
    pub fn install(
        event_loop: Arc<EventThread>,
        file: std::fs::File,
        protocol: Arc<dyn Protocol>,
    ) -> Arc<Self> {
        let fd = file.as_raw_fd();
        set_nonblocking(fd);
        let this = Arc::new_cyclic(|weak| {
            let _ = weak;
            Self {
                event_loop: event_loop.clone(),
                fd,
                protocol,
                state: Mutex::new(UnixWritePipeState {
                    file,
                    write_buffer: VecDeque::new(),
                    writer_registered: false,
                    paused: false,
                }),
                closing: AtomicBool::new(false),
                self_weak: OnceLock::new(),
            }
        });
        let _ = this.self_weak.set(Arc::downgrade(&this));
        this.protocol.connection_made(this.clone() as Arc<dyn Transport>);
        this
    }

    fn on_writable(self: &Arc<Self>) {
        let (drained_to_empty, should_resume) = {
            let mut state = self.state.lock().unwrap();
            loop {
                if state.write_buffer.is_empty() {
                    break;
                }
                let chunk: Vec<u8> = state.write_buffer.iter().copied().collect();
                match state.file.write(&chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        state.write_buffer.drain(..n);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
            let resume = state.paused && state.write_buffer.len() <= WRITE_LOW_WATER;
            if resume {
                state.paused = false;
            }
            (state.write_buffer.is_empty(), resume)
        };
        if should_resume {
            self.protocol.resume_writing();
        }
        if drained_to_empty {
            let mut state = self.state.lock().unwrap();
            if state.writer_registered {
                self.event_loop.remove_writer(self.fd);
                state.writer_registered = false;
            }
        }
    }
}

#[cfg(unix)]
impl Transport for UnixWritePipeTransport {
    fn write(&self, data: &[u8]) {
        if self.closing.load(AtomicOrdering::Acquire) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.write_buffer.is_empty() {
            match state.file.write(data) {
                Ok(n) if n == data.len() => return,
                Ok(n) => state.write_buffer.extend(&data[n..]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    state.write_buffer.extend(data);
                }
                Err(_) => return,
            }
        } else {
            state.write_buffer.extend(data);
        }

        if !state.writer_registered {
            state.writer_registered = true;
            if let Some(this) = self.self_weak.get().and_then(Weak::upgrade) {
                self.event_loop.add_writer(
                    self.fd,
                    Arc::new(move || {
                        this.on_writable();
                        Ok(())
                    }),
                );
            }
        }
        if state.write_buffer.len() > WRITE_HIGH_WATER && !state.paused {
            state.paused = true;
            drop(state);
            self.protocol.pause_writing();
        }
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    fn write_eof(&self) {
        let mut state = self.state.lock().unwrap();
        // A pipe has no half-close primitive; closing the write end is the
        // closest equivalent, matching the source's `can_write_eof` meaning
        // "further writes are impossible" rather than "shutdown(SHUT_WR)".
        self.closing.store(true, AtomicOrdering::Release);
        self.event_loop.remove_writer(self.fd);
        state.write_buffer.clear();
    }

    fn close(&self) {
        if self.closing.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.event_loop.remove_writer(self.fd);
        self.protocol.connection_lost(None);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(AtomicOrdering::Acquire)
    }

    fn get_extra_info(&self, _name: &str) -> Option<String> {
        None
    }
}

/// `make_unix_read_pipe_transport` (spec §6): adapts a pipe read-end into a
/// [`Transport`]. The returned future resolves synchronously — installation
/// never suspends.
#[cfg(unix)]
#[must_use]
pub fn make_unix_read_pipe_transport(
    event_loop: Arc<EventThread>,
    file: std::fs::File,
    protocol: Arc<dyn StreamProtocol>,
) -> EvFuture<Arc<dyn Transport>> {
    let waiter = EvFuture::new(event_loop.as_loop_handle());
    let ready = waiter.clone();
    let transport = UnixReadPipeTransport::install(event_loop, file, protocol);
    let _ = ready.set_result(transport as Arc<dyn Transport>);
    waiter
}

/// # Errors
///
/// Always returns [`EvLoopError::NotImplemented`] on non-UNIX platforms.
#[cfg(not(unix))]
pub fn make_unix_read_pipe_transport() -> Result<()> {
    Err(EvLoopError::NotImplemented("unix pipe transports require a UNIX platform"))
}

/// `make_unix_write_pipe_transport` (spec §6): adapts a pipe write-end into
/// a [`Transport`]. The returned future resolves synchronously —
/// installation never suspends.
#[cfg(unix)]
#[must_use]
pub fn make_unix_write_pipe_transport(
    event_loop: Arc<EventThread>,
    file: std::fs::File,
    protocol: Arc<dyn Protocol>,
) -> EvFuture<Arc<dyn Transport>> {
    let waiter = EvFuture::new(event_loop.as_loop_handle());
    let ready = waiter.clone();
    let transport = UnixWritePipeTransport::install(event_loop, file, protocol);
    let _ = ready.set_result(transport as Arc<dyn Transport>);
    waiter
}

/// # Errors
///
/// Always returns [`EvLoopError::NotImplemented`] on non-UNIX platforms.
#[cfg(not(unix))]
pub fn make_unix_write_pipe_transport() -> Result<()> {
    Err(EvLoopError::NotImplemented("unix pipe transports require a UNIX platform"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;

    struct RecordingProtocol {
        received: StdMutex<Vec<u8>>,
        lost: StdMutex<bool>,
    }

    impl Protocol for RecordingProtocol {
        fn connection_made(&self, _transport: Arc<dyn Transport>) {}
        fn connection_lost(&self, _error: Option<EvLoopError>) {
            *self.lost.lock().unwrap() = true;
        }
    }

    impl StreamProtocol for RecordingProtocol {
        fn data_received(&self, data: &[u8]) {
            self.received.lock().unwrap().extend_from_slice(data);
        }
    }

    #[test]
    fn socket_transport_delivers_bytes_and_reports_close() {
        let event_loop = EventThread::new().unwrap();
        event_loop.ensure_started();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = listener.accept().unwrap();

        let protocol = Arc::new(RecordingProtocol {
            received: StdMutex::new(Vec::new()),
            lost: StdMutex::new(false),
        });
        let _waiter = make_socket_transport(event_loop.clone(), server_stream, protocol.clone());

        let mut client = client;
        client.write_all(b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert_eq!(&*protocol.received.lock().unwrap(), b"hello");
        assert!(
            *protocol.lost.lock().unwrap(),
            "reader must keep firing past its first readiness event to observe EOF"
        );
        event_loop.stop();
        event_loop.join();
    }

    #[test]
    fn server_tracks_closed_state() {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::new(addr);
        assert!(!server.is_closed());
        server.close();
        assert!(server.is_closed());
    }
}
