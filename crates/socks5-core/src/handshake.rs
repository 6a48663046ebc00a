use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::buffer::Buffer;
use crate::error::ProxyError;

/// SOCKS5 version byte (RFC 1928).
const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 reply codes (the subset this proxy ever sends).
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// The internal handshake state. Each variant carries exactly the data that
/// state needs to complete, which is what makes `Fail` and `Success`
/// genuinely terminal: there is no transition defined out of them, so a
/// caller that keeps invoking `proceed` after either gets a `false` no-op
/// rather than undefined behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    GreetingHeader,
    GreetingMethods { nmethods: usize },
    RequestHeader,
    RequestAddrV4,
    RequestAddrV6,
    RequestAddrDomainLen,
    RequestAddrDomainName { len: usize },
    WaitConnect { addr: SocketAddr },
    Response,
    Success,
    Fail,
}

impl HandshakeState {
    /// Minimum number of staged bytes `proceed` needs to make progress from
    /// this state; `0` for states that act without consuming more input.
    fn required_size(&self) -> usize {
        match self {
            HandshakeState::GreetingHeader => 2,
            HandshakeState::GreetingMethods { nmethods } => *nmethods,
            HandshakeState::RequestHeader => 4,
            HandshakeState::RequestAddrV4 => 6,
            HandshakeState::RequestAddrV6 => 18,
            HandshakeState::RequestAddrDomainLen => 1,
            HandshakeState::RequestAddrDomainName { len } => *len,
            HandshakeState::WaitConnect { .. } | HandshakeState::Response => 0,
            HandshakeState::Success | HandshakeState::Fail => 0,
        }
    }
}

/// The side-effecting hooks the handshake needs from whoever owns the client
/// and destination sockets. Named after, and grounded on, the original's
/// `ResponseCallback`/`ConnectCallback`/`DestAddressCallback` typedefs; here
/// they're trait methods rather than three separately-stored closures.
pub trait HandshakeIo {
    /// Send `data` to the client. Fails with [`ProxyError::ShortWrite`] on a
    /// short or failed write (the handshake treats it as fatal).
    fn send_response(&mut self, data: &[u8]) -> Result<(), ProxyError>;
    /// Open and connect a socket to `addr`, wrapping any failure in
    /// [`ProxyError::Connect`].
    fn connect(&mut self, addr: SocketAddr) -> Result<(), ProxyError>;
    /// The local address of the just-opened destination socket, used to
    /// populate `BND.ADDR`/`BND.PORT` in the success reply.
    fn dest_local_addr(&mut self) -> Option<SocketAddr>;
}

/// A state machine that processes the SOCKS5 handshake. Not thread-safe by
/// itself: the relay worker only ever drives it from the upstream thread.
pub struct Handshake {
    state: HandshakeState,
    error: Option<ProxyError>,
}

impl Handshake {
    #[must_use]
    pub fn new() -> Self {
        Handshake {
            state: HandshakeState::GreetingHeader,
            error: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == HandshakeState::Success
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.state == HandshakeState::Fail
    }

    #[must_use]
    pub fn insufficient_buffer(&self, buffer: &Buffer) -> bool {
        buffer.data_size() < self.state.required_size()
    }

    /// Take the error that drove the handshake into `Fail`, if any. A
    /// version mismatch or a rejected method set fails without one: those
    /// are ordinary protocol outcomes, not an internal error condition.
    pub fn take_error(&mut self) -> Option<ProxyError> {
        self.error.take()
    }

    fn fail(&mut self, error: ProxyError) {
        self.error = Some(error);
        self.state = HandshakeState::Fail;
    }

    fn fail_with_reply(&mut self, io: &mut impl HandshakeIo, rep: u8, error: ProxyError) {
        let reply = build_reply(rep, None);
        let _ = io.send_response(&reply);
        self.fail(error);
    }

    /// Perform one state transition, consuming `self.state.required_size()`
    /// bytes from `buffer` where the state needs input. Returns `true` if a
    /// transition was made without failure; `false` once `state()` is
    /// `Fail`, or as a no-op if it was already `Fail`/`Success`.
    pub fn proceed(&mut self, buffer: &mut Buffer, io: &mut impl HandshakeIo) -> bool {
        match &self.state {
            HandshakeState::Fail | HandshakeState::Success => false,
            HandshakeState::GreetingHeader => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut header = [0u8; 2];
                buffer.copy_out(&mut header);
                if header[0] != VERSION {
                    self.fail(ProxyError::Protocol("unsupported SOCKS version in greeting"));
                    return false;
                }
                self.state = HandshakeState::GreetingMethods {
                    nmethods: header[1] as usize,
                };
                true
            }
            HandshakeState::GreetingMethods { nmethods } => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut methods = vec![0u8; *nmethods];
                buffer.copy_out(&mut methods);
                if methods.contains(&METHOD_NO_AUTH) {
                    if let Err(error) = io.send_response(&[VERSION, METHOD_NO_AUTH]) {
                        self.fail(error);
                        return false;
                    }
                    self.state = HandshakeState::RequestHeader;
                    true
                } else {
                    let _ = io.send_response(&[VERSION, METHOD_NONE_ACCEPTABLE]);
                    self.fail(ProxyError::Protocol(
                        "client offered no acceptable authentication method",
                    ));
                    false
                }
            }
            HandshakeState::RequestHeader => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut header = [0u8; 4];
                buffer.copy_out(&mut header);
                let [ver, cmd, _rsv, atyp] = header;
                if ver != VERSION {
                    self.fail(ProxyError::Protocol("unsupported SOCKS version in request"));
                    return false;
                }
                if cmd != CMD_CONNECT {
                    self.fail_with_reply(
                        io,
                        REP_CMD_NOT_SUPPORTED,
                        ProxyError::Protocol("CONNECT is the only supported command"),
                    );
                    return false;
                }
                self.state = match atyp {
                    ATYP_V4 => HandshakeState::RequestAddrV4,
                    ATYP_V6 => HandshakeState::RequestAddrV6,
                    ATYP_DOMAIN => HandshakeState::RequestAddrDomainLen,
                    _ => {
                        self.fail_with_reply(
                            io,
                            REP_ATYP_NOT_SUPPORTED,
                            ProxyError::Protocol("unsupported address type"),
                        );
                        return false;
                    }
                };
                true
            }
            HandshakeState::RequestAddrV4 => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut body = [0u8; 6];
                buffer.copy_out(&mut body);
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                self.state = HandshakeState::WaitConnect {
                    addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                };
                true
            }
            HandshakeState::RequestAddrV6 => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut body = [0u8; 18];
                buffer.copy_out(&mut body);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([body[16], body[17]]);
                self.state = HandshakeState::WaitConnect {
                    addr: SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
                };
                true
            }
            HandshakeState::RequestAddrDomainLen => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut len_byte = [0u8; 1];
                buffer.copy_out(&mut len_byte);
                self.state = HandshakeState::RequestAddrDomainName {
                    len: len_byte[0] as usize,
                };
                true
            }
            HandshakeState::RequestAddrDomainName { len } => {
                if self.insufficient_buffer(buffer) {
                    return false;
                }
                let mut name = vec![0u8; *len];
                buffer.copy_out(&mut name);
                // Domain names are parsed so the stream stays in sync, but
                // resolving them is out of scope; always decline.
                self.fail_with_reply(
                    io,
                    REP_ATYP_NOT_SUPPORTED,
                    ProxyError::Protocol("domain name resolution is not supported"),
                );
                false
            }
            HandshakeState::WaitConnect { addr } => {
                let addr = *addr;
                match io.connect(addr) {
                    Ok(()) => {
                        self.state = HandshakeState::Response;
                        true
                    }
                    Err(error) => {
                        self.fail_with_reply(io, REP_GENERAL_FAILURE, error);
                        false
                    }
                }
            }
            HandshakeState::Response => {
                let bound = io.dest_local_addr();
                let reply = build_reply(REP_SUCCESS, bound);
                match io.send_response(&reply) {
                    Ok(()) => {
                        self.state = HandshakeState::Success;
                        true
                    }
                    Err(error) => {
                        self.fail(error);
                        false
                    }
                }
            }
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a SOCKS5 reply: `VER REP RSV ATYP BND.ADDR BND.PORT`. Falls back to
/// `0.0.0.0:0` when no bound address is available (error replies, or a
/// destination socket whose local address couldn't be queried).
fn build_reply(rep: u8, bound: Option<SocketAddr>) -> Vec<u8> {
    let mut out = vec![VERSION, rep, 0x00];
    match bound {
        Some(SocketAddr::V4(v4)) => {
            out.push(ATYP_V4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            out.push(ATYP_V6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
        None => {
            out.push(ATYP_V4);
            out.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
            out.extend_from_slice(&0u16.to_be_bytes());
        }
    }
    out
}
