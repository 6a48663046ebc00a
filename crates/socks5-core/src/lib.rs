//! Buffer, socket, handshake state machine and relay worker for a SOCKS5
//! proxy bridging a client-facing listener (TCP or VM socket) to outbound
//! TCP. No CLI, no process entry point, no listener socket: those live in
//! the `socks5-proxy` binary crate.

pub mod buffer;
pub mod error;
pub mod handshake;
pub mod relay;
pub mod socket;

pub use buffer::Buffer;
pub use error::ProxyError;
pub use handshake::{Handshake, HandshakeIo, HandshakeState};
pub use relay::serve_client;
pub use socket::Socket;
