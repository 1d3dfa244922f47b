//! Process bootstrap for plugin binaries.
//!
//! Usage:
//! ```ignore
//! use pipeline_plugin::serve_sink;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     serve_sink(MySink::default).await
//! }
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::logging::init_logging;
use crate::message::Handshake;
use crate::plugin::{PluginFactory, Processor, Sink, Source};
use crate::server::PluginServer;

pub async fn serve_source<S, F>(f: F) -> Result<()>
where
    S: Source,
    F: Fn() -> S + Send + Sync + 'static,
{
    serve(PluginFactory::source(f)).await
}

pub async fn serve_sink<S, F>(f: F) -> Result<()>
where
    S: Sink,
    F: Fn() -> S + Send + Sync + 'static,
{
    serve(PluginFactory::sink(f)).await
}

pub async fn serve_processor<P, F>(f: F) -> Result<()>
where
    P: Processor,
    F: Fn() -> P + Send + Sync + 'static,
{
    serve(PluginFactory::processor(f)).await
}

/// Loads the config from the environment and serves until Ctrl-C or SIGTERM.
pub async fn serve(factory: PluginFactory) -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    serve_with(factory, config, shutdown_signal()).await
}

/// Binds, announces the address, then accepts connections until `shutdown`
/// resolves. Every session is closed before this returns.
pub async fn serve_with<S>(factory: PluginFactory, config: RuntimeConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    if let Err(e) = init_logging(&config.log) {
        eprintln!("logging setup failed: {e:#}");
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let addr = listener.local_addr()?;
    let server = Arc::new(PluginServer::new(factory, &config));

    let handshake = Handshake::new(addr.to_string(), server.role());
    announce(&handshake, config.handshake_file.as_deref()).await?;
    info!(address = %addr, role = %server.role(), "plugin listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, "set_nodelay failed: {e}");
                    }
                    let server = server.clone();
                    tokio::spawn(async move {
                        info!(%peer, "host connected");
                        let (rd, wr) = stream.into_split();
                        if let Err(e) = server.serve_connection(rd, wr).await {
                            warn!(%peer, "connection failed: {e:#}");
                        }
                        info!(%peer, "host disconnected");
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    info!(sessions = server.registry().len(), "shutting down");
    server.shutdown().await;
    Ok(())
}

/// Writes the handshake line to stdout and, when configured, to `file`.
async fn announce(handshake: &Handshake, file: Option<&Path>) -> Result<()> {
    let mut line = serde_json::to_string(handshake)?;
    line.push('\n');

    if let Some(path) = file {
        tokio::fs::write(path, line.as_bytes())
            .await
            .with_context(|| format!("failed to write handshake file {}", path.display()))?;
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
