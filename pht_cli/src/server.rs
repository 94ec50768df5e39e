//! Echo server over the tunnel.

use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use pht::{
    connection::TunnelConnection,
    server::{self, TunnelHandler},
    DEFAULT_POLL_CYCLE_SECS, DEFAULT_SESSION_TIMEOUT_SECS,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Arguments for the server command.
#[derive(Debug, clap::Parser)]
pub(crate) struct ServerArgs {
    /// Socket address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub(crate) listen: SocketAddr,

    /// Shared key clients must present
    #[arg(short, long, env = "PHT_KEY")]
    pub(crate) key: String,

    /// Seconds a poll response may stay idle before the client re-polls
    #[arg(long, default_value_t = DEFAULT_POLL_CYCLE_SECS)]
    pub(crate) poll_cycle: u64,

    /// Seconds without requests before a session is reaped
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT_SECS)]
    pub(crate) session_timeout: u64,
}

/// Run the echo server until `token` is cancelled.
pub(crate) async fn run(args: ServerArgs, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(args.listen).await?;

    let handler = TunnelHandler::new(&args.key, echo)
        .with_poll_cycle(Duration::from_secs(args.poll_cycle))
        .with_session_timeout(Duration::from_secs(args.session_timeout));

    server::serve(listener, handler, token).await;

    tracing::info!("server stopped");
    Ok(())
}

async fn echo(conn: TunnelConnection) {
    let tunnel = conn.token().clone();
    let peer = conn.peer_addr();
    tracing::info!(token = %tunnel, ?peer, "echoing tunnel");

    let (mut reader, mut writer) = tokio::io::split(conn);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => tracing::info!(token = %tunnel, "tunnel ended after echoing {n} bytes"),
        Err(e) => tracing::warn!(token = %tunnel, "echo failed: {e}"),
    }
}
