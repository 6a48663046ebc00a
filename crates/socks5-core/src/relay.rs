use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::buffer::Buffer;
use crate::error::ProxyError;
use crate::handshake::{Handshake, HandshakeIo};
use crate::socket::{Socket, SocketReader, SocketWriter};

/// Matches the original's `kSocketTimeoutSec`: the longest a direction
/// thread will wait for readiness before checking whether it should give up.
const SOCKET_TIMEOUT_MS: i32 = 5_000;

/// Done-flags shared between a connection's two direction threads, replacing
/// the original's `std::atomic_bool` pair on `Socks5State` (there,
/// `shared_from_this` kept the whole worker alive past a `detach()`; here the
/// spawning thread instead joins the downstream `JoinHandle`, so this struct
/// only needs to carry the flags themselves).
struct RelayShared {
    upstream_done: AtomicBool,
    downstream_done: AtomicBool,
}

impl RelayShared {
    fn new() -> Self {
        RelayShared {
            upstream_done: AtomicBool::new(false),
            downstream_done: AtomicBool::new(false),
        }
    }

    fn set_upstream_done(&self) {
        self.upstream_done.store(true, Ordering::SeqCst);
    }

    fn upstream_done(&self) -> bool {
        self.upstream_done.load(Ordering::SeqCst)
    }

    fn set_downstream_done(&self) {
        self.downstream_done.store(true, Ordering::SeqCst);
    }

    fn downstream_done(&self) -> bool {
        self.downstream_done.load(Ordering::SeqCst)
    }
}

struct HandshakeCallbacks<'a> {
    client: &'a mut Socket,
    dest: &'a mut Option<Socket>,
}

impl HandshakeIo for HandshakeCallbacks<'_> {
    fn send_response(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        let mut out = Buffer::with_block_capacity(data.len().max(64));
        out.copy_in(data);
        self.client.write_some(&mut out);
        let remaining = out.data_size();
        if remaining == 0 {
            Ok(())
        } else {
            Err(ProxyError::ShortWrite {
                wrote: data.len() - remaining,
                expected: data.len(),
            })
        }
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<(), ProxyError> {
        match Socket::connect_tcp(addr) {
            Ok(sock) => {
                *self.dest = Some(sock);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%addr, %error, "failed to connect to destination");
                Err(ProxyError::Connect(error))
            }
        }
    }

    fn dest_local_addr(&mut self) -> Option<SocketAddr> {
        self.dest
            .as_ref()
            .and_then(|sock| crate::socket::local_addr(sock.native_handle()))
    }
}

/// Drive the SOCKS5 handshake on `client_fd` to completion and, on success,
/// relay traffic between the client and the requested destination until
/// either side closes or the 5-second idle watchdog fires. Returns once both
/// directions have stopped; never panics on ordinary connection failures.
///
/// Grounded on `ReceiveWorker::Socks5Worker`/`DestToClientForwarder`: one
/// thread (this one) carries the handshake and the client-to-destination
/// direction, spawning a second thread for destination-to-client once the
/// handshake succeeds.
pub fn serve_client(client_fd: OwnedFd, buffer_size: usize) {
    let client_handle = client_fd.as_raw_fd();
    let mut client_socket = match Socket::from_fd(client_fd) {
        Ok(sock) => sock,
        Err(error) => {
            tracing::warn!(client_handle, %error, "failed to prepare client socket");
            return;
        }
    };

    let mut handshake = Handshake::new();
    let mut upstream_buffer = Buffer::with_block_capacity(buffer_size);
    let mut dest_socket: Option<Socket> = None;

    loop {
        if !client_socket.poll_readable(SOCKET_TIMEOUT_MS) {
            tracing::warn!(client_handle, "client handshake timed out");
            return;
        }
        client_socket.read_some(&mut upstream_buffer);
        if client_socket.read_eof() {
            tracing::debug!(client_handle, "client closed during handshake");
            return;
        }
        if !client_socket.readable() {
            tracing::warn!(
                client_handle,
                errno = client_socket.read_errno(),
                "client read error during handshake"
            );
            return;
        }

        {
            let mut io = HandshakeCallbacks {
                client: &mut client_socket,
                dest: &mut dest_socket,
            };
            while !handshake.succeeded()
                && !handshake.failed()
                && handshake.proceed(&mut upstream_buffer, &mut io)
            {}
        }

        if handshake.failed() {
            match handshake.take_error() {
                Some(error) => tracing::warn!(client_handle, %error, "SOCKS5 handshake failed"),
                None => tracing::warn!(client_handle, "SOCKS5 handshake failed"),
            }
            return;
        }
        if handshake.succeeded() {
            break;
        }
    }

    let dest_socket = dest_socket.expect("a succeeded handshake always connected a destination");
    let dest_handle = dest_socket.native_handle();
    tracing::debug!(client_handle, dest_handle, "handshake complete, relaying");

    let shared = Arc::new(RelayShared::new());
    let (client_reader, client_writer) = client_socket.into_split();
    let (dest_reader, dest_writer) = dest_socket.into_split();

    let downstream_shared = Arc::clone(&shared);
    let downstream = thread::spawn(move || {
        run_downstream(
            dest_reader,
            client_writer,
            buffer_size,
            &downstream_shared,
            dest_handle,
            client_handle,
        );
    });

    run_upstream(
        client_reader,
        dest_writer,
        upstream_buffer,
        &shared,
        client_handle,
        dest_handle,
    );

    if downstream.join().is_err() {
        tracing::warn!(client_handle, "downstream relay thread panicked");
    }
}

/// The outcome of one read-and-wait pass in a relay direction loop.
enum ReadOutcome {
    /// Bytes were read; the buffer may have grown.
    Progress,
    /// The peer closed its write side.
    Eof,
    /// No data arrived within the poll timeout.
    TimedOut,
    /// A non-benign errno was recorded.
    Error(ProxyError),
}

fn wait_and_read(reader: &mut SocketReader, buffer: &mut Buffer, timeout_ms: i32) -> ReadOutcome {
    if !reader.poll_readable(timeout_ms) {
        return ReadOutcome::TimedOut;
    }
    reader.read_some(buffer);
    if reader.read_eof() {
        return ReadOutcome::Eof;
    }
    if !reader.readable() {
        return ReadOutcome::Error(ProxyError::Io(std::io::Error::from_raw_os_error(
            reader.read_errno(),
        )));
    }
    ReadOutcome::Progress
}

/// Write all of `buffer` to `writer`, waiting out `EWOULDBLOCK`/`EAGAIN`
/// backpressure on the next writability poll rather than treating it as
/// fatal (the non-blocking-socket-plus-poll substitution recorded for the
/// original's short-write-is-fatal behavior; a genuine short write on a
/// writable socket still terminates the connection).
fn write_all(writer: &mut SocketWriter, buffer: &mut Buffer, timeout_ms: i32) -> Result<(), ProxyError> {
    while buffer.data_size() > 0 {
        let before = buffer.data_size();
        writer.write_some(buffer);
        let errno = writer.write_errno();
        if errno == 0 {
            return Ok(());
        }
        if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
            if !writer.poll_writable(timeout_ms) {
                return Err(ProxyError::ShortWrite {
                    wrote: before - buffer.data_size(),
                    expected: before,
                });
            }
            continue;
        }
        if errno == libc::EINTR {
            continue;
        }
        return Err(ProxyError::Io(std::io::Error::from_raw_os_error(errno)));
    }
    Ok(())
}

fn run_upstream(
    mut reader: SocketReader,
    mut writer: SocketWriter,
    mut buffer: Buffer,
    shared: &RelayShared,
    client_handle: RawFd,
    dest_handle: RawFd,
) {
    loop {
        if buffer.data_size() > 0 {
            if let Err(error) = write_all(&mut writer, &mut buffer, SOCKET_TIMEOUT_MS) {
                tracing::warn!(dest_handle, %error, "write to destination failed");
                break;
            }
        }

        match wait_and_read(&mut reader, &mut buffer, SOCKET_TIMEOUT_MS) {
            ReadOutcome::Progress => {}
            ReadOutcome::Eof => {
                tracing::debug!(client_handle, "client connection closed by peer");
                break;
            }
            ReadOutcome::Error(error) => {
                tracing::warn!(client_handle, %error, "client connection read failed");
                break;
            }
            ReadOutcome::TimedOut => {
                if shared.downstream_done() {
                    tracing::debug!(client_handle, "closing client side, destination is gone");
                    break;
                }
                continue;
            }
        }
    }
    if let Err(error) = writer.shutdown() {
        tracing::debug!(dest_handle, %error, "shutting down destination write side failed");
    }
    shared.set_upstream_done();
}

#[allow(clippy::too_many_arguments)]
fn run_downstream(
    mut reader: SocketReader,
    mut writer: SocketWriter,
    buffer_size: usize,
    shared: &RelayShared,
    dest_handle: RawFd,
    client_handle: RawFd,
) {
    let mut buffer = Buffer::with_block_capacity(buffer_size);
    loop {
        match wait_and_read(&mut reader, &mut buffer, SOCKET_TIMEOUT_MS) {
            ReadOutcome::Progress => {}
            ReadOutcome::Eof => {
                tracing::debug!(dest_handle, "destination connection closed by peer");
                break;
            }
            ReadOutcome::Error(error) => {
                tracing::warn!(dest_handle, %error, "destination connection read failed");
                break;
            }
            ReadOutcome::TimedOut => {
                if shared.upstream_done() {
                    tracing::debug!(dest_handle, "closing destination side, client is gone");
                    break;
                }
                continue;
            }
        }

        if buffer.data_size() > 0 {
            if let Err(error) = write_all(&mut writer, &mut buffer, SOCKET_TIMEOUT_MS) {
                tracing::warn!(client_handle, %error, "write to client failed");
                break;
            }
        }
    }
    if let Err(error) = writer.shutdown() {
        tracing::debug!(client_handle, %error, "shutting down client write side failed");
    }
    shared.set_downstream_done();
}
