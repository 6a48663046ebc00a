use std::io;

/// Errors surfaced while driving a single client/destination pair through
/// the handshake and relay phases.
///
/// None of these ever travel back across the wire beyond the single SOCKS5
/// reply byte the handshake already sends; they exist to be logged and to
/// tell the caller the connection is done.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("SOCKS5 protocol violation: {0}")]
    Protocol(&'static str),

    #[error("failed to connect to destination: {0}")]
    Connect(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("short write: wrote {wrote} of {expected} bytes")]
    ShortWrite { wrote: usize, expected: usize },
}
