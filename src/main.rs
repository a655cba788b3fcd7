//! pclipsync: bidirectional X11 CLIPBOARD/PRIMARY sync between two peers
//! connected by a stream byte channel (typically an SSH-forwarded Unix
//! domain socket). This binary is the lifecycle/transport shell around
//! the sync engine.

mod engine;
mod fingerprint;
mod frame;
mod lifecycle;
mod transport;
mod x11;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use engine::{EngineExit, Session};
use lifecycle::{exit_code, Shutdown};
use x11::XAdapter;

/// `pclipsync (--server | --client) <SOCKET_PATH> [-v] [-h]`
#[derive(Parser, Debug)]
#[command(name = "pclipsync", about = "Bidirectional X11 clipboard sync over a peer socket")]
struct Cli {
    /// Run as the listening side: bind SOCKET_PATH and accept one peer.
    #[arg(long, conflicts_with = "client", required_unless_present = "client")]
    server: bool,

    /// Run as the connecting side: dial SOCKET_PATH, retrying with backoff.
    #[arg(long, conflicts_with = "server", required_unless_present = "server")]
    client: bool,

    /// Path to the Unix domain socket (typically SSH-forwarded).
    socket_path: PathBuf,

    /// Raise log verbosity (-v = info, -vv = debug). RUST_LOG overrides this.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.default_log_filter()),
    )
    .try_init();

    if cli.server == cli.client {
        // clap's conflicts_with/required_unless_present pair already
        // rejects "neither" and "both" before we get here; this is
        // defense in depth, not a path we expect to reach in practice.
        error!("exactly one of --server or --client is required");
        return ExitCode::from(exit_code::USAGE_ERROR as u8);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e:#}");
            return ExitCode::from(exit_code::RUNTIME_ERROR as u8);
        }
    };

    let result = if cli.server {
        runtime.block_on(run_server(cli.socket_path))
    } else {
        runtime.block_on(run_client(cli.socket_path))
    };

    match result {
        Ok(()) => ExitCode::from(exit_code::CLEAN as u8),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code::RUNTIME_ERROR as u8)
        }
    }
}

/// Server mode: listen, accept exactly one peer, run the engine, clean up
/// the socket file on every exit path.
async fn run_server(socket_path: PathBuf) -> anyhow::Result<()> {
    let shutdown = Shutdown::new();
    lifecycle::install_signal_handlers(shutdown.clone())?;

    let listener = transport::bind_server(&socket_path).await?;
    let x = XAdapter::open().context("opening X11 display")?;
    let mut session = Session::new(x);

    // Cleanup must run on every exit path, including signal-driven ones —
    // guard with a drop-based unlink rather than duplicating the call at
    // each return site.
    struct CleanupSocket<'a>(&'a std::path::Path);
    impl Drop for CleanupSocket<'_> {
        fn drop(&mut self) {
            transport::unlink(self.0);
        }
    }
    let _cleanup = CleanupSocket(&socket_path);

    let peer = tokio::select! {
        biased;
        _ = shutdown.wait() => {
            info!("shutdown requested before a peer connected");
            return Ok(());
        }
        accepted = transport::accept_one(&listener) => accepted?,
    };

    match session.run(peer, &shutdown).await {
        EngineExit::PeerClosed | EngineExit::ShutdownRequested => Ok(()),
        EngineExit::Frame(e) => {
            error!("peer framing error: {e}");
            Err(anyhow::anyhow!("peer framing error: {e}"))
        }
        EngineExit::PeerIo(e) => Err(anyhow::Error::new(e).context("peer I/O error")),
        EngineExit::Fatal(e) => Err(e),
    }
}

/// Client mode: connect with exponential backoff, resetting the
/// echo-guard before every attempt. The X display and owner window are
/// created once and reused across reconnects.
async fn run_client(socket_path: PathBuf) -> anyhow::Result<()> {
    let shutdown = Shutdown::new();
    lifecycle::install_signal_handlers(shutdown.clone())?;

    let x = XAdapter::open().context("opening X11 display")?;
    let mut session = Session::new(x);
    let mut backoff = transport::Backoff::new();

    loop {
        if shutdown.requested() {
            return Ok(());
        }

        session.reset_echo_guard();

        let peer = tokio::select! {
            biased;
            _ = shutdown.wait() => return Ok(()),
            attempt = transport::connect_once(&socket_path) => attempt,
        };

        let peer = match peer {
            Ok(stream) => {
                info!("connected to {}", socket_path.display());
                backoff.reset();
                stream
            }
            Err(e) => {
                info!("connect to {} failed: {e}; retrying", socket_path.display());
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => return Ok(()),
                    _ = backoff.wait() => {}
                }
                continue;
            }
        };

        match session.run(peer, &shutdown).await {
            EngineExit::ShutdownRequested => return Ok(()),
            EngineExit::PeerClosed => {
                info!("server closed the connection; reconnecting");
            }
            EngineExit::Frame(e) => {
                error!("peer framing error: {e}; reconnecting");
            }
            EngineExit::PeerIo(e) => {
                error!("peer I/O error: {e:#}; reconnecting");
            }
            EngineExit::Fatal(e) => {
                // A fatal X error is not something a reconnect can fix.
                return Err(e);
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.wait() => return Ok(()),
            _ = backoff.wait() => {}
        }
    }
}
