//! Minimal HTTP/1.1 framing for the control plane.
//!
//! Exec start switches the connection to a raw protocol right after the
//! response head, so requests are written and responses parsed by hand on
//! the socket rather than through a request/response client.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use portal_core::NegotiationError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Upper bound on a response head.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Serialize a request.
#[must_use]
pub fn encode_request(
    method: &str,
    path: &str,
    host: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    let body = body.unwrap_or_default();
    if !body.is_empty() || method == "POST" {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Parsed status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 2xx status.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Exec attach succeeded: switched protocols, or a plain 200 hijack.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.status == 101 || self.status == 200
    }

    fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Offset of the blank line ending the head, if present.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Parse a response head (without the terminating blank line).
///
/// # Errors
/// Returns `MalformedResponse` on a bad status line or header.
pub fn parse_head(raw: &[u8]) -> Result<ResponseHead, NegotiationError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| NegotiationError::MalformedResponse("non-UTF-8 response head".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(NegotiationError::MalformedResponse(format!(
            "bad status line: {status_line:?}"
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            NegotiationError::MalformedResponse(format!("bad status line: {status_line:?}"))
        })?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            NegotiationError::MalformedResponse(format!("bad header line: {line:?}"))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Read until the head terminator and parse the head.
///
/// Returns the head and any bytes received past it.
///
/// # Errors
/// Returns `MalformedResponse` if the peer closes early or the head is too
/// large, `Io` on read failure.
pub async fn read_head<S>(stream: &mut S) -> Result<(ResponseHead, BytesMut), NegotiationError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(4096);
    let mut scanned = 0;

    loop {
        if let Some(pos) = find_head_end(&buf[scanned..]) {
            let end = scanned + pos;
            let head = parse_head(&buf[..end])?;
            let leftover = buf.split_off(end + HEAD_TERMINATOR.len());
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(NegotiationError::MalformedResponse(
                "response head too large".into(),
            ));
        }
        // Terminator may straddle reads.
        scanned = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(NegotiationError::MalformedResponse(
                "connection closed before response head".into(),
            ));
        }
    }
}

/// Read the response body for a `Connection: close` request.
///
/// # Errors
/// Returns `MalformedResponse` on bad chunk framing, `Io` on read failure.
pub async fn read_body<S>(
    stream: &mut S,
    head: &ResponseHead,
    leftover: BytesMut,
) -> Result<Vec<u8>, NegotiationError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    if head.status == 204 || head.status == 304 {
        return Ok(Vec::new());
    }

    let mut body = leftover.to_vec();
    if let (false, Some(len)) = (head.is_chunked(), head.content_length()) {
        if body.len() < len {
            let mut rest = vec![0; len - body.len()];
            stream.read_exact(&mut rest).await?;
            body.extend_from_slice(&rest);
        }
        body.truncate(len);
        return Ok(body);
    }

    stream.read_to_end(&mut body).await?;
    if head.is_chunked() {
        decode_chunked(&body)
    } else {
        Ok(body)
    }
}

/// Decode a complete chunked transfer-encoded body.
///
/// # Errors
/// Returns `MalformedResponse` on bad chunk framing.
pub fn decode_chunked(mut raw: &[u8]) -> Result<Vec<u8>, NegotiationError> {
    let malformed = |msg: &str| NegotiationError::MalformedResponse(format!("chunked body: {msg}"));
    let mut out = Vec::new();

    loop {
        let line_end = raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| malformed("missing size line"))?;
        let size_line = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| malformed("non-UTF-8 size line"))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size =
            usize::from_str_radix(size_hex, 16).map_err(|_| malformed("bad chunk size"))?;
        raw = &raw[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if raw.len() < size + 2 {
            return Err(malformed("truncated chunk"));
        }
        out.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

/// Stream wrapper that replays bytes already read past the response head
/// before reading from the underlying connection.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    /// Wrap `inner`, serving `prefix` first.
    pub const fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet replayed.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_encode_request() {
        let raw = encode_request(
            "POST",
            "/exec/abc/start",
            "localhost",
            &[("Content-Type", "application/json"), ("Upgrade", "tcp")],
            Some(br#"{"Detach":false}"#),
        );
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("POST /exec/abc/start HTTP/1.1\r\nHost: localhost\r\n"));
        assert!(text.contains("Upgrade: tcp\r\n"));
        assert!(text.contains("Content-Length: 16\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"Detach\":false}"));
    }

    #[test]
    fn test_parse_head() {
        let head = parse_head(
            b"HTTP/1.1 101 UPGRADED\r\nContent-Type: application/vnd.docker.raw-stream\r\nConnection: Upgrade",
        )
        .unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(head.reason, "UPGRADED");
        assert!(head.is_attached());
        assert_eq!(head.header("connection"), Some("Upgrade"));
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(parse_head(b"SSH-2.0-OpenSSH").is_err());
        assert!(parse_head(b"HTTP/1.1 abc Nope").is_err());
        assert!(parse_head(b"HTTP/1.1 200 OK\r\nno-colon-here").is_err());
    }

    #[tokio::test]
    async fn test_read_head_keeps_bytes_past_terminator() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 101 UPGRADED\r\nConn")
            .read(b"ection: Upgrade\r\n\r")
            .read(b"\n$ prompt")
            .build();
        let (head, leftover) = read_head(&mut stream).await.unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(&leftover[..], b"$ prompt");
    }

    #[tokio::test]
    async fn test_read_head_early_close() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 OK\r\n")
            .build();
        assert!(matches!(
            read_head(&mut stream).await,
            Err(NegotiationError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_read_body_content_length() {
        let raw = b"HTTP/1.1 201 Created\r\nContent-Length: 10\r\n\r\n{\"Id\":";
        let mut stream = tokio_test::io::Builder::new()
            .read(raw)
            .read(b"\"x\"}")
            .build();
        let (head, leftover) = read_head(&mut stream).await.unwrap();
        let body = read_body(&mut stream, &head, leftover).await.unwrap();
        assert_eq!(body, br#"{"Id":"x"}"#);
    }

    #[test]
    fn test_decode_chunked() {
        let body = decode_chunked(b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"Wikipedia");
        assert!(decode_chunked(b"zz\r\n").is_err());
        assert!(decode_chunked(b"10\r\nshort\r\n").is_err());
    }

    #[tokio::test]
    async fn test_rewind_replays_prefix_first() {
        let inner = tokio_test::io::Builder::new().read(b" world").build();
        let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
