//! TCP listener that turns accepted sockets into registered connections.

use crate::error::NetworkError;
use crate::handshake;
use crate::registry::ConnectionRegistry;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound for a client to complete the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts WebSocket clients and hands them to the registry.
pub struct NetworkServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl NetworkServer {
    pub async fn bind(
        addr: &str,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            shutdown,
            started: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until the shutdown token is cancelled.
    ///
    /// May only be called once; later calls return
    /// [`NetworkError::AlreadyStarted`].
    pub async fn start(&self) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyStarted);
        }
        info!("Server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let registry = Arc::clone(&self.registry);
                        tokio::spawn(serve_client(stream, addr, registry));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        info!("Stopped accepting connections");
        Ok(())
    }
}

async fn serve_client(stream: TcpStream, addr: SocketAddr, registry: Arc<ConnectionRegistry>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }

    let (websocket, token) = match timeout(HANDSHAKE_TIMEOUT, handshake::accept(stream, &registry)).await {
        Ok(Ok(upgraded)) => upgraded,
        Ok(Err(e)) => {
            debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("Handshake with {} timed out", addr);
            return;
        }
    };

    if let Err(e) = registry.admit(websocket, addr, &token).await {
        warn!("Could not admit client from {}: {}", addr, e);
    }
}
