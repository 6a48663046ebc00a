use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use crate::config::ListenConfig;

/// Bind failure retry budget, lifted from `proxy.cc`'s `main`: five
/// attempts, doubling the delay (starting at 500ms) before each retry.
const BIND_RETRIES: u32 = 5;
const INITIAL_RETRY_DELAY_MS: u64 = 500;

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let reuse: libc::c_int = 1;
    // SAFETY: well-formed setsockopt call on a freshly created socket.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::from_ref(&reuse).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn bind_tcp(port: u16) -> io::Result<OwnedFd> {
    // SAFETY: socket()/bind() with well-formed arguments.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a valid, just-created fd not owned elsewhere.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_reuseaddr(fd.as_raw_fd())?;

    // SAFETY: zero-initialized sockaddr_in is a valid representation.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();
    // SAFETY: addr/len describe a valid sockaddr_in for bind().
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn bind_vsock(port: u16) -> io::Result<OwnedFd> {
    // SAFETY: socket()/bind() with well-formed arguments.
    let raw = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a valid, just-created fd not owned elsewhere.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_reuseaddr(fd.as_raw_fd())?;

    // SAFETY: zero-initialized sockaddr_vm is a valid representation.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_cid = libc::VMADDR_CID_ANY;
    addr.svm_port = u32::from(port);
    // SAFETY: addr/len describe a valid sockaddr_vm for bind().
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn bind_once(config: &ListenConfig) -> io::Result<OwnedFd> {
    if config.vsock {
        bind_vsock(config.port)
    } else {
        bind_tcp(config.port)
    }
}

fn bind_with_retry(config: &ListenConfig) -> io::Result<OwnedFd> {
    let mut retries_left = BIND_RETRIES;
    let mut delay_ms = INITIAL_RETRY_DELAY_MS;
    loop {
        match bind_once(config) {
            Ok(fd) => return Ok(fd),
            Err(error) if retries_left > 0 => {
                retries_left -= 1;
                delay_ms *= 2;
                tracing::warn!(
                    %error,
                    retries_left,
                    delay_ms,
                    "listener bind failed, retrying"
                );
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(error) => return Err(error),
        }
    }
}

fn accept_once(listener_fd: RawFd, vsock: bool) -> io::Result<OwnedFd> {
    let raw = if vsock {
        let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t;
        // SAFETY: addr/len describe valid out-parameters for accept().
        unsafe { libc::accept(listener_fd, std::ptr::from_mut(&mut addr).cast(), &mut len) }
    } else {
        let mut addr: libc::sockaddr = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr>() as libc::socklen_t;
        // SAFETY: addr/len describe valid out-parameters for accept().
        unsafe { libc::accept(listener_fd, std::ptr::from_mut(&mut addr).cast(), &mut len) }
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is a valid, just-accepted fd not owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Bind (with retry), listen, and accept forever, spawning a relay worker
/// thread per accepted connection. Grounded on `Server::ListenerWorker`/
/// `AcceptSocketConnection`/`AcceptVSocketConnection`/`SpawnReceiveWorker`;
/// unlike the original, `listen()` is called once up front rather than
/// inside the accept loop (re-listening on an already-listening socket is a
/// no-op there, so this changes nothing observable).
pub fn run(config: ListenConfig) -> io::Result<()> {
    let listener_fd = bind_with_retry(&config)?;
    // SAFETY: listener_fd was just bound above.
    if unsafe { libc::listen(listener_fd.as_raw_fd(), 5) } < 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::info!(
        port = config.port,
        vsock = config.vsock,
        "listening for connections"
    );

    loop {
        match accept_once(listener_fd.as_raw_fd(), config.vsock) {
            Ok(client_fd) => {
                let client_handle = client_fd.as_raw_fd();
                tracing::info!(client_handle, "accepted connection");
                let buffer_size = config.buffer_size;
                thread::spawn(move || socks5_core::serve_client(client_fd, buffer_size));
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
            }
        }
    }
}
