mod config;
mod listener;

use config::ListenConfig;

fn mask_sigpipe() {
    // SAFETY: installing a well-formed sigaction for SIGPIPE at startup,
    // before any other thread exists. Mirrors `proxy.cc`'s `sigaction` call.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(libc::SIGPIPE, &act, std::ptr::null_mut());
    }
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("info"),
        ))
        .init();

    mask_sigpipe();

    let config = match ListenConfig::parse() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(error) = listener::run(config) {
        tracing::error!(%error, "fatal error, terminating proxy instance");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}
