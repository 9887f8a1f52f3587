//! TCP admin listener that accepts client connections and spawns handler
//! tasks.
//!
//! Handles graceful shutdown on SIGINT: stops accepting new connections and
//! waits for in-flight commands to drain before exiting.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::cluster::ClusterCoordinator;
use crate::connection;

/// Binds to `addr` and serves admin connections until ctrl-c.
pub async fn run(
    addr: SocketAddr,
    coordinator: Arc<ClusterCoordinator>,
    max_connections: usize,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr} (max {max_connections} connections)");
    serve(listener, coordinator, max_connections, tokio::signal::ctrl_c()).await
}

/// Runs the accept loop on `listener` until `shutdown` resolves.
///
/// Excess clients beyond `max_connections` are dropped immediately.
pub async fn serve<F>(
    listener: TcpListener,
    coordinator: Arc<ClusterCoordinator>,
    max_connections: usize,
    shutdown: F,
) -> io::Result<()>
where
    F: Future,
{
    let max_connections = max_connections.max(1);
    let semaphore = Arc::new(Semaphore::new(max_connections));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, draining connections...");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = result?;

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, dropping connection from {peer}");
                        drop(stream);
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY for {peer}: {e}");
                }
                let coordinator = Arc::clone(&coordinator);

                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, coordinator).await {
                        error!("connection error from {peer}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }

    info!("waiting for active connections to close...");
    let _ = semaphore.acquire_many(max_connections as u32).await;
    info!("all connections drained, shutting down");
    Ok(())
}
