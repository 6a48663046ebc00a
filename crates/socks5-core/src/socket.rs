use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::buffer::Buffer;

/// Matches the original's `kReadSize`: the amount of spare capacity we ask
/// the buffer to reserve on each `read_some` pass.
const READ_SIZE: usize = crate::buffer::DEFAULT_BLOCK_SIZE;

fn iov_max() -> usize {
    libc::IOV_MAX as usize
}

fn benign_errno(value: i32) -> bool {
    value == 0 || value == libc::EWOULDBLOCK || value == libc::EAGAIN || value == libc::EINTR
}

fn set_non_blocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL on a valid fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    // SAFETY: see above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read as much as possible into `to_buffer` without blocking, looping until
/// the OS buffer is drained, EOF, or a real error. Returns `(hit_eof,
/// errno)`, mirroring `Socket::ReadSome`'s bookkeeping exactly.
fn read_some_raw(fd: RawFd, to_buffer: &mut Buffer) -> (bool, i32) {
    let mut read_size: isize;
    loop {
        let mut segments = to_buffer.reserve_at_least(READ_SIZE);
        let n = segments.len().min(iov_max());
        // SAFETY: segments point at spare capacity owned by to_buffer for
        // the duration of this call.
        read_size = unsafe { libc::readv(fd, segments.as_mut_ptr(), n as i32) };
        if read_size <= 0 {
            to_buffer.commit(0);
            break;
        }
        to_buffer.commit(read_size as usize);
    }
    if read_size == 0 {
        (true, 0)
    } else {
        (false, io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

/// Write as much of `from_buffer` as possible without blocking, looping on
/// partial `writev`s until the buffer drains or a real error occurs. Returns
/// the resulting errno (`0` on a clean, complete drain), mirroring
/// `Socket::WriteSome` exactly.
fn write_some_raw(fd: RawFd, from_buffer: &mut Buffer) -> i32 {
    loop {
        let mut segments = from_buffer.peek();
        if segments.is_empty() {
            return 0;
        }
        let n = segments.len().min(iov_max());
        // SAFETY: segments point at readable bytes owned by from_buffer for
        // the duration of this call.
        let write_size = unsafe { libc::writev(fd, segments.as_mut_ptr(), n as i32) };
        if write_size < 0 {
            from_buffer.drain(0);
            return io::Error::last_os_error().raw_os_error().unwrap_or(0);
        }
        from_buffer.drain(write_size as usize);
        if from_buffer.data_size() == 0 {
            return 0;
        }
    }
}

/// Wait up to `timeout_ms` for `fd` to become ready for `events`
/// (`libc::POLLIN`/`POLLOUT`), standing in for the original's
/// `SO_RCVTIMEO` now that the socket is genuinely non-blocking.
fn poll_ready(fd: RawFd, events: i16, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: single well-formed pollfd, valid for the call's duration.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    ret != 0
}

/// The local address of a connected socket, used to populate `BND.ADDR`/
/// `BND.PORT` in the SOCKS5 success reply (`getsockname`, as the original's
/// `DestAddressCallback` does).
#[must_use]
pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage is large enough for any sockaddr getsockname can fill.
    let ret = unsafe {
        libc::getsockname(
            fd,
            std::ptr::from_mut(&mut storage).cast(),
            std::ptr::from_mut(&mut len),
        )
    };
    if ret < 0 {
        return None;
    }
    match storage.ss_family as i32 {
        libc::AF_INET => {
            // SAFETY: family tag confirms this is a sockaddr_in.
            let sa: libc::sockaddr_in =
                unsafe { std::ptr::from_ref(&storage).cast::<libc::sockaddr_in>().read() };
            let ip = std::net::Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(std::net::SocketAddrV4::new(
                ip,
                u16::from_be(sa.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: family tag confirms this is a sockaddr_in6.
            let sa: libc::sockaddr_in6 = unsafe {
                std::ptr::from_ref(&storage)
                    .cast::<libc::sockaddr_in6>()
                    .read()
            };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// A non-blocking stream socket wrapper tracking the errno state needed to
/// tell benign "would block"/EOF conditions from real failures, mirroring
/// the original's `Socket` class. Used single-threaded during accept/connect
/// and the handshake; once the handshake succeeds, [`Socket::into_split`]
/// hands the two halves to the relay's two direction threads.
pub struct Socket {
    fd: OwnedFd,
    read_errno: i32,
    write_errno: i32,
    read_eof: bool,
}

impl Socket {
    /// Take ownership of an already-connected or already-accepted fd and
    /// put it into non-blocking mode.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        set_non_blocking(fd.as_raw_fd(), true)?;
        Ok(Socket {
            fd,
            read_errno: 0,
            write_errno: 0,
            read_eof: false,
        })
    }

    /// Connect to a destination address (the SOCKS5 CONNECT target). Always
    /// plain TCP: vsock is only ever used on the client-facing listener side.
    pub fn connect_tcp(addr: SocketAddr) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        // SAFETY: socket() with well-formed arguments; fd ownership is
        // transferred into OwnedFd immediately on success.
        let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a valid, just-created fd not owned elsewhere.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let (storage, len) = sockaddr_from(addr);
        // SAFETY: storage/len describe a valid sockaddr for connect().
        let ret = unsafe { libc::connect(fd.as_raw_fd(), storage.as_ptr().cast(), len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let nodelay: libc::c_int = 1;
        // SAFETY: well-formed setsockopt call; failure is non-fatal (the
        // original ignores its return value too).
        unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                std::ptr::from_ref(&nodelay).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        Socket::from_fd(fd)
    }

    #[must_use]
    pub fn native_handle(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read as much as possible into `to_buffer` without blocking. Mirrors
    /// `Socket::ReadSome` exactly.
    pub fn read_some(&mut self, to_buffer: &mut Buffer) {
        let (eof, errno) = read_some_raw(self.fd.as_raw_fd(), to_buffer);
        self.read_eof = eof;
        self.read_errno = errno;
    }

    /// Write as much of `from_buffer` as possible without blocking. Mirrors
    /// `Socket::WriteSome` exactly.
    pub fn write_some(&mut self, from_buffer: &mut Buffer) {
        self.write_errno = write_some_raw(self.fd.as_raw_fd(), from_buffer);
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        !self.read_eof && benign_errno(self.read_errno)
    }

    /// A read error (not just EOF) is treated as the socket no longer being
    /// writable either: half-close is not reliably supported on common
    /// networks, matching the original's documented trade-off.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.readable() && benign_errno(self.write_errno)
    }

    #[must_use]
    pub fn read_eof(&self) -> bool {
        self.read_eof
    }

    #[must_use]
    pub fn read_errno(&self) -> i32 {
        self.read_errno
    }

    /// Wait up to `timeout_ms` for the fd to become readable.
    #[must_use]
    pub fn poll_readable(&self, timeout_ms: i32) -> bool {
        poll_ready(self.fd.as_raw_fd(), libc::POLLIN, timeout_ms)
    }

    /// Half- or fully close the socket (`libc::SHUT_RD`/`SHUT_WR`/
    /// `SHUT_RDWR`) without releasing the fd itself. Mirrors `Socket::Shutdown`.
    pub fn shutdown(&self, how: libc::c_int) -> io::Result<()> {
        // SAFETY: self.fd is a valid, open socket fd for the duration of the call.
        if unsafe { libc::shutdown(self.fd.as_raw_fd(), how) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Split into an owning reader/writer pair sharing the same fd, which
    /// closes once both halves have been dropped. Used to hand a connected
    /// socket to the relay's two direction threads without a shared mutex:
    /// each half only ever touches the errno/eof state for its own
    /// direction.
    #[must_use]
    pub fn into_split(self) -> (SocketReader, SocketWriter) {
        let fd = Arc::new(self.fd);
        (
            SocketReader {
                fd: fd.clone(),
                errno: self.read_errno,
                eof: self.read_eof,
            },
            SocketWriter {
                fd,
                errno: self.write_errno,
            },
        )
    }
}

/// The read half of a [`Socket`] produced by [`Socket::into_split`].
pub struct SocketReader {
    fd: Arc<OwnedFd>,
    errno: i32,
    eof: bool,
}

impl SocketReader {
    #[must_use]
    pub fn native_handle(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn read_some(&mut self, to_buffer: &mut Buffer) {
        let (eof, errno) = read_some_raw(self.fd.as_raw_fd(), to_buffer);
        self.eof = eof;
        self.errno = errno;
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        !self.eof && benign_errno(self.errno)
    }

    #[must_use]
    pub fn read_eof(&self) -> bool {
        self.eof
    }

    #[must_use]
    pub fn read_errno(&self) -> i32 {
        self.errno
    }

    #[must_use]
    pub fn poll_readable(&self, timeout_ms: i32) -> bool {
        poll_ready(self.fd.as_raw_fd(), libc::POLLIN, timeout_ms)
    }

    /// Shut down the read side (`libc::SHUT_RD`) of the shared fd.
    pub fn shutdown(&self) -> io::Result<()> {
        // SAFETY: self.fd is a valid, open socket fd for the duration of the call.
        if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RD) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The write half of a [`Socket`] produced by [`Socket::into_split`].
pub struct SocketWriter {
    fd: Arc<OwnedFd>,
    errno: i32,
}

impl SocketWriter {
    #[must_use]
    pub fn native_handle(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn write_some(&mut self, from_buffer: &mut Buffer) {
        self.errno = write_some_raw(self.fd.as_raw_fd(), from_buffer);
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        benign_errno(self.errno)
    }

    #[must_use]
    pub fn write_errno(&self) -> i32 {
        self.errno
    }

    #[must_use]
    pub fn poll_writable(&self, timeout_ms: i32) -> bool {
        poll_ready(self.fd.as_raw_fd(), libc::POLLOUT, timeout_ms)
    }

    /// Shut down the write side (`libc::SHUT_WR`) of the shared fd.
    pub fn shutdown(&self) -> io::Result<()> {
        // SAFETY: self.fd is a valid, open socket fd for the duration of the call.
        if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn sockaddr_from(
    addr: SocketAddr,
) -> ([u8; std::mem::size_of::<libc::sockaddr_in6>()], libc::socklen_t) {
    let mut storage = [0u8; std::mem::size_of::<libc::sockaddr_in6>()];
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sizes match, both are plain-old-data.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::from_ref(&sa).cast::<u8>(),
                    storage.as_mut_ptr(),
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sizes match, both are plain-old-data.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    std::ptr::from_ref(&sa).cast::<u8>(),
                    storage.as_mut_ptr(),
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}
