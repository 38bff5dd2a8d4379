//! TCP acceptor: owns the listen socket and spawns one handler task per
//! accepted connection.

use std::sync::Arc;

use anyhow::Context;
use rhttp_core::wire::SharedPipe;
use tokio::net::{lookup_host, TcpSocket};
use tracing::{debug, info};

use crate::config::Settings;
use crate::handler;

const LISTEN_BACKLOG: u32 = 128;

/// Bind the listen socket with address reuse and accept forever. Handlers
/// are independent; they only meet at the pipe lock.
pub async fn run_server(settings: Arc<Settings>, pipe: SharedPipe) -> anyhow::Result<()> {
    let addr = lookup_host((settings.http_host.as_str(), settings.http_port))
        .await
        .with_context(|| format!("resolving {}:{}", settings.http_host, settings.http_port))?
        .next()
        .with_context(|| format!("no addresses for {}", settings.http_host))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("binding {addr}"))?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    info!(
        "serving http://{}{}",
        addr,
        String::from_utf8_lossy(&settings.server_prefix)
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        let pipe = pipe.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            if let Err(err) = handler::handle_connection(stream, pipe, settings).await {
                debug!("connection from {peer} ended: {err:#}");
            }
        });
    }
}
