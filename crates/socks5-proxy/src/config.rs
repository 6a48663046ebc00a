use clap::Parser;

/// Minimum buffer size accepted, matching the original's documented floor.
const MIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--buffer-size must be at least {MIN_BUFFER_SIZE} bytes, got {0}")]
    BufferTooSmall(usize),
}

/// Command-line configuration surface, grounded on `Config::Parse`'s
/// call-sites (`socks5_port_`, `buffer_size_`, `vsock_`).
#[derive(Parser, Debug)]
#[command(name = "socks5-proxy", about = "SOCKS5 proxy bridging a listener to outbound TCP")]
struct Cli {
    /// Port to listen on.
    #[arg(long)]
    port: u16,

    /// Per-connection buffer block size, in bytes.
    #[arg(long, default_value_t = socks5_core::buffer::DEFAULT_BLOCK_SIZE)]
    buffer_size: usize,

    /// Listen on AF_VSOCK (VMADDR_CID_ANY) instead of AF_INET/INADDR_ANY.
    #[arg(long)]
    vsock: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenConfig {
    pub port: u16,
    pub buffer_size: usize,
    pub vsock: bool,
}

impl ListenConfig {
    pub fn parse() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        if cli.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(cli.buffer_size));
        }
        Ok(ListenConfig {
            port: cli.port,
            buffer_size: cli.buffer_size,
            vsock: cli.vsock,
        })
    }
}
