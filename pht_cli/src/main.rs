//! Command-line server and client for the polling HTTP tunnel.
//!
//! `pht server` runs an endpoint that echoes every tunnel back to its
//! sender. `pht client` dials an endpoint and pipes stdin and stdout through
//! the tunnel.

mod client;
mod server;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries tunnel data in client mode.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Arguments::parse();

    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let token = token.clone();
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if hits.fetch_add(1, Ordering::Relaxed) == 0 {
                        eprintln!("Ctrl+C: shutting down (press again to force)");
                        token.cancel();
                    } else {
                        eprintln!("Force exiting.");
                        std::process::exit(130);
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let t = token.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                eprintln!("SIGTERM: shutting down");
                t.cancel();
            }
        });
    }

    match args.command {
        Command::Server(args) => server::run(args, token).await,
        Command::Client(args) => client::run(args, token).await,
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Full-duplex byte streams over plain HTTP")]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a tunnel endpoint that echoes every connection
    Server(server::ServerArgs),

    /// Dial an endpoint and pipe stdin/stdout through the tunnel
    Client(client::ClientArgs),
}
