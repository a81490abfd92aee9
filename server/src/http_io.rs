//! Just enough HTTP/1.1 for the upgrade rejections and the health endpoint.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Largest request head we are willing to buffer.
pub(crate) const MAX_REQUEST_HEAD: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;
const PEEK_RETRY: Duration = Duration::from_millis(5);

fn head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|start| start + 4)
}

/// Waits until a complete request head is buffered on `stream` and returns a
/// copy of it. Nothing is consumed, so the socket can still be handed to the
/// WebSocket upgrade afterwards.
pub(crate) async fn peek_request_head(stream: &TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;

    loop {
        let read = stream.peek(&mut buf).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the request head",
            ));
        }
        if let Some(end) = head_end(&buf[..read]) {
            buf.truncate(end);
            return Ok(buf);
        }
        if read == buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head exceeded max bytes",
            ));
        }
        // peek returns immediately while old data is buffered
        if read == seen {
            tokio::time::sleep(PEEK_RETRY).await;
        }
        seen = read;
    }
}

/// Consumes `len` already peeked bytes.
pub(crate) async fn discard(stream: &mut TcpStream, len: usize) -> io::Result<()> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map(|_| ())
}

/// Parses a complete request head. `None` if it is not valid HTTP/1.x.
pub(crate) fn parse_request_head(head: &[u8]) -> Option<Request> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let mut builder = Request::builder().method(parsed.method?).uri(parsed.path?);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder.body(()).ok()
}

/// Writes a plain-text response and shuts the write half down.
pub(crate) async fn write_response<S>(stream: &mut S, status: StatusCode, body: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
