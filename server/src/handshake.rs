//! WebSocket upgrade and bearer-token extraction.
//!
//! Requests are rejected before the upgrade completes:
//! - 400 when the request is not a WebSocket upgrade
//! - 401 when the `Authorization: Bearer <token>` header is missing,
//!   malformed, or carries a token the registry refuses
//! - 503 once the server is shutting down
//!
//! The request head is peeked off the socket and checked before the
//! WebSocket library sees it, so malformed upgrades get a status line
//! instead of a silent close.

use crate::error::NetworkError;
use crate::http_io;
use crate::registry::ConnectionRegistry;
use crate::transport::{FrameSink, FrameSource, Transport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{Method, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

const BEARER_PREFIX: &str = "Bearer ";

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: &'static str,
}

impl Rejection {
    fn bad_request(reason: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason,
        }
    }

    fn unauthorized(reason: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            reason,
        }
    }

    /// Maps a registry admission error onto an HTTP rejection.
    pub fn from_admission(err: &NetworkError) -> Self {
        let reason = match err {
            NetworkError::Unauthorized => "Invalid authorization token",
            NetworkError::ServerShuttingDown => "Server is shutting down",
            _ => "Server unavailable",
        };
        Self {
            status: StatusCode::from_u16(err.rejection_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            reason,
        }
    }

    /// The error the handshake reports for this rejection.
    pub fn into_error(self) -> NetworkError {
        match self.status {
            StatusCode::BAD_REQUEST => NetworkError::BadRequest(self.reason),
            StatusCode::UNAUTHORIZED => NetworkError::Unauthorized,
            _ => NetworkError::ServerShuttingDown,
        }
    }

    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.reason.to_string()));
        *response.status_mut() = self.status;
        response
    }
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn is_websocket_upgrade(request: &Request) -> bool {
    *request.method() == Method::GET
        && header(request, "Connection").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        && header(request, "Upgrade").is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
        && header(request, "Sec-WebSocket-Key").is_some()
        && header(request, "Sec-WebSocket-Version") == Some("13")
}

/// Validates the upgrade headers and returns the bearer token.
pub fn authorize_request(request: &Request) -> Result<String, Rejection> {
    if !is_websocket_upgrade(request) {
        return Err(Rejection::bad_request("WebSocket connection required"));
    }

    let Some(authorization) = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    else {
        return Err(Rejection::unauthorized("Authorization token required"));
    };

    match authorization.strip_prefix(BEARER_PREFIX) {
        Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(Rejection::unauthorized("Invalid authorization header format")),
    }
}

/// Frame and message limits matching the largest envelope `decode` accepts,
/// so oversized frames are refused before they are buffered.
pub fn websocket_config() -> WebSocketConfig {
    let limit = protocol::HEADER_LEN + protocol::MAX_PAYLOAD_LEN;
    WebSocketConfig {
        max_message_size: Some(limit),
        max_frame_size: Some(limit),
        ..WebSocketConfig::default()
    }
}

/// Performs the WebSocket upgrade on an accepted socket.
///
/// The request head is validated first and refused requests are answered
/// with their HTTP status. The registry's admission check then runs inside
/// the upgrade callback so shutdown races still get a 503. Returns the
/// upgraded stream together with the bearer token to admit it with.
pub async fn accept(
    stream: TcpStream,
    registry: &ConnectionRegistry,
) -> Result<(WebSocketStream<TcpStream>, String), NetworkError> {
    let head = http_io::peek_request_head(&stream)
        .await
        .map_err(NetworkError::TransportFailure)?;
    let checked = match http_io::parse_request_head(&head) {
        Some(request) => authorize_request(&request).and_then(|token| {
            registry
                .check_admission(&token)
                .map(|()| token)
                .map_err(|e| Rejection::from_admission(&e))
        }),
        None => Err(Rejection::bad_request("Malformed HTTP request")),
    };
    let token = match checked {
        Ok(token) => token,
        Err(rejection) => return Err(refuse(stream, head.len(), rejection).await),
    };

    let admitted = token.clone();
    let callback = move |_request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        registry
            .check_admission(&admitted)
            .map_err(|e| Rejection::from_admission(&e).into_response())?;
        Ok(response)
    };

    let websocket =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(websocket_config()))
            .await
            .map_err(|e| NetworkError::TransportFailure(ws_to_io(e)))?;
    Ok((websocket, token))
}

/// Answers a refused request on the raw socket.
async fn refuse(mut stream: TcpStream, head_len: usize, rejection: Rejection) -> NetworkError {
    let written = async {
        http_io::discard(&mut stream, head_len).await?;
        http_io::write_response(&mut stream, rejection.status, rejection.reason).await
    };
    if let Err(e) = written.await {
        debug!("Could not send {} response: {}", rejection.status, e);
    }
    rejection.into_error()
}

fn ws_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

struct WebSocketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> Transport for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = StreamExt::split(self);
        (
            Box::new(WebSocketSource { stream }),
            Box::new(WebSocketSink { sink }),
        )
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                // Text frames are passed through and will fail to decode.
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ws_to_io(e)),
            }
        }
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.sink.send(Message::Binary(frame)).await.map_err(ws_to_io)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_to_io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    const UPGRADE: [(&str, &str); 4] = [
        ("Connection", "Upgrade"),
        ("Upgrade", "websocket"),
        ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ("Sec-WebSocket-Version", "13"),
    ];

    #[test]
    fn test_valid_bearer_token() {
        let mut headers = UPGRADE.to_vec();
        headers.push(("Authorization", "Bearer abc.def.ghi"));
        assert_eq!(authorize_request(&request(&headers)).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_upgrade_header_case_insensitive() {
        let headers = [
            ("Connection", "keep-alive, upgrade"),
            ("Upgrade", "WebSocket"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Version", "13"),
            ("Authorization", "Bearer t"),
        ];
        assert_eq!(authorize_request(&request(&headers)).unwrap(), "t");
    }

    #[test]
    fn test_incomplete_upgrade_is_bad_request() {
        for missing in ["Sec-WebSocket-Key", "Sec-WebSocket-Version", "Connection"] {
            let mut headers: Vec<_> = UPGRADE.iter().copied().filter(|(name, _)| *name != missing).collect();
            headers.push(("Authorization", "Bearer t"));
            let rejection = authorize_request(&request(&headers)).unwrap_err();
            assert_eq!(rejection.status, StatusCode::BAD_REQUEST, "without {}", missing);
        }

        let mut headers = UPGRADE.to_vec();
        headers.push(("Authorization", "Bearer t"));
        let mut post = request(&headers);
        *post.method_mut() = Method::POST;
        assert_eq!(authorize_request(&post).unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rejection_errors() {
        let rejection = Rejection::bad_request("WebSocket connection required");
        assert!(matches!(rejection.into_error(), NetworkError::BadRequest(_)));
        assert!(matches!(
            Rejection::unauthorized("x").into_error(),
            NetworkError::Unauthorized
        ));
        assert!(matches!(
            Rejection::from_admission(&NetworkError::ServerShuttingDown).into_error(),
            NetworkError::ServerShuttingDown
        ));
    }

    #[test]
    fn test_websocket_limits_match_codec() {
        let config = websocket_config();
        let limit = protocol::HEADER_LEN + protocol::MAX_PAYLOAD_LEN;
        assert_eq!(config.max_message_size, Some(limit));
        assert_eq!(config.max_frame_size, Some(limit));
    }

    #[test]
    fn test_missing_upgrade_is_bad_request() {
        let rejection = authorize_request(&request(&[("Authorization", "Bearer t")])).unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);

        let headers = [
            ("Connection", "Upgrade"),
            ("Upgrade", "h2c"),
            ("Authorization", "Bearer t"),
        ];
        let rejection = authorize_request(&request(&headers)).unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_authorization_is_unauthorized() {
        let rejection = authorize_request(&request(&UPGRADE)).unwrap_err();
        assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);
        assert_eq!(rejection.reason, "Authorization token required");
    }

    #[test]
    fn test_malformed_authorization_is_unauthorized() {
        for value in ["Basic dXNlcjpwYXNz", "Bearer", "Bearer ", "Bearer    ", "bearer abc", "abc"] {
            let mut headers = UPGRADE.to_vec();
            headers.push(("Authorization", value));
            let rejection = authorize_request(&request(&headers)).unwrap_err();
            assert_eq!(rejection.status, StatusCode::UNAUTHORIZED, "header {:?}", value);
        }
    }

    #[test]
    fn test_admission_rejections() {
        let rejection = Rejection::from_admission(&NetworkError::Unauthorized);
        assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);

        let rejection = Rejection::from_admission(&NetworkError::ServerShuttingDown);
        assert_eq!(rejection.status, StatusCode::SERVICE_UNAVAILABLE);

        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body().as_deref(), Some("Server is shutting down"));
    }

    #[tokio::test]
    async fn test_plain_get_answered_with_bad_request() {
        use crate::auth::AllowAnyToken;
        use crate::config::NetworkConfig;
        use crate::simulation;
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio_util::sync::CancellationToken;

        let (publisher, _joins) = simulation::channel(1);
        let registry = ConnectionRegistry::new(
            NetworkConfig::default(),
            Arc::new(AllowAnyToken),
            publisher,
            CancellationToken::new(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer abc\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let (stream, _) = listener.accept().await.unwrap();
        let err = accept(stream, &registry).await.unwrap_err();
        assert!(matches!(err, NetworkError::BadRequest(_)));

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 "), "got {:?}", response);
        assert!(response.ends_with("WebSocket connection required"));
        assert!(registry.is_empty());
    }
}
