//! Plain HTTP endpoint for health checks.
//!
//! Serves `GET /health` with `200 ok` on its own port so load balancers can
//! check the process without speaking WebSocket. Every response closes the
//! connection.

use crate::error::NetworkError;
use crate::http_io;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

/// Upper bound for reading a request and writing the reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MetaServer {
    listener: TcpListener,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl MetaServer {
    pub async fn bind(addr: &str, shutdown: CancellationToken) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shutdown,
            started: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until the shutdown token is cancelled. One-shot like
    /// [`crate::network::NetworkServer::start`].
    pub async fn start(&self) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyStarted);
        }
        info!("Meta endpoint listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(async move {
                            match timeout(REQUEST_TIMEOUT, serve_request(stream)).await {
                                Ok(Err(e)) => debug!("Meta request from {} failed: {}", addr, e),
                                Err(_) => debug!("Meta request from {} timed out", addr),
                                Ok(Ok(())) => {}
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting meta connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        info!("Meta endpoint stopped");
        Ok(())
    }
}

async fn serve_request(mut stream: TcpStream) -> std::io::Result<()> {
    let head = http_io::peek_request_head(&stream).await?;
    http_io::discard(&mut stream, head.len()).await?;

    let (status, body) = match http_io::parse_request_head(&head) {
        Some(request) => route(&request),
        None => (StatusCode::BAD_REQUEST, "bad request"),
    };
    http_io::write_response(&mut stream, status, body).await
}

/// Status and body for a request.
pub fn route(request: &Request) -> (StatusCode, &'static str) {
    match request.uri().path() {
        "/health" if *request.method() == Method::GET => (StatusCode::OK, "ok"),
        "/health" => (StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => (StatusCode::NOT_FOUND, "not found"),
    }
}
