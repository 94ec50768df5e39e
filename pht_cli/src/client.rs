//! Pipe stdin and stdout through a tunnel.

use std::time::Duration;

use anyhow::Result;
use pht::client::TunnelClient;
use tokio_util::sync::CancellationToken;

/// How long to wait for the disconnect request after the tunnel closes.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Arguments for the client command.
#[derive(Debug, clap::Parser)]
pub(crate) struct ClientArgs {
    /// Server host, as `host:port` or a full `http(s)://` base URL
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub(crate) host: String,

    /// Shared key presented to the server
    #[arg(short, long, env = "PHT_KEY")]
    pub(crate) key: String,
}

/// Dial the server and copy stdin to the tunnel and the tunnel to stdout.
///
/// Returns when the server ends the tunnel or `token` is cancelled. End of
/// stdin does not close the tunnel, so replies keep arriving.
pub(crate) async fn run(args: ClientArgs, token: CancellationToken) -> Result<()> {
    let client = TunnelClient::new(&args.host, &args.key);
    let conn = client.dial().await?;
    tracing::info!(token = %conn.token(), "connected to {}", client.base_url());

    let (mut reader, mut writer) = tokio::io::split(conn);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        () = token.cancelled() => tracing::info!("closing tunnel"),
        res = tokio::io::copy(&mut reader, &mut stdout) => {
            let n = res?;
            tracing::info!("tunnel closed by server after {n} bytes");
        }
        res = async {
            let n = tokio::io::copy(&mut stdin, &mut writer).await?;
            tracing::debug!("stdin closed after {n} bytes");
            std::future::pending::<std::io::Result<()>>().await
        } => res?,
    }

    reader.unsplit(writer).close();

    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        while !client.sessions().is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("gave up waiting for disconnect");
    }

    Ok(())
}
