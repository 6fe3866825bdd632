//! Minimal HTTP/1.1 request/response line-and-header framing.
//!
//! The original service parsed only the start-line and headers with Go's
//! `http.ReadRequest`/`http.ReadResponse` and streamed the body through
//! unmodified; this does the same by hand rather than pulling in a full
//! HTTP framework, so the public data plane never normalizes anything it
//! doesn't have to (spec §4.6, round-trip laws R1/R2).

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, UpstreamError};

const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// How much body follows the headers, per RFC 7230 §3.3.3 (simplified: we
/// only need content-length vs "everything else", since every request we
/// proxy uses a fresh stream with no pipelining).
pub enum BodyLength {
    Fixed(u64),
    UntilClose,
}

fn body_length_with_default(headers: &[(String, String)], no_header_default: BodyLength) -> BodyLength {
    if let Some(te) = header_value(headers, "transfer-encoding") {
        if te.eq_ignore_ascii_case("chunked") {
            return BodyLength::UntilClose;
        }
    }
    match header_value(headers, "content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(len) => BodyLength::Fixed(len),
        None => no_header_default,
    }
}

/// RFC 7230 §3.3.3 rule 6: a request with neither `Transfer-Encoding:
/// chunked` nor `Content-Length` has a body of length zero — unlike a
/// response, "everything else" is not a valid default, since the public
/// peer is waiting for a reply and will never signal "done" by closing.
pub fn request_body_length(headers: &[(String, String)]) -> BodyLength {
    body_length_with_default(headers, BodyLength::Fixed(0))
}

/// A response with neither header is framed by the connection closing.
pub fn response_body_length(headers: &[(String, String)]) -> BodyLength {
    body_length_with_default(headers, BodyLength::UntilClose)
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    if n == 0 {
        return Err(ProtocolError::UnexpectedEof);
    }
    if line.len() > MAX_HEADER_LINE {
        return Err(ProtocolError::FrameTooLarge);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

async fn read_headers<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProtocolError::FrameTooLarge);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(ProtocolError::MalformedFrame)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Parse a request-line and headers. Used by the client agent reading a
/// request off a fresh multiplexed stream (spec §4.8).
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<RequestHead, ProtocolError> {
    let line = read_line(reader).await?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().ok_or(ProtocolError::MalformedFrame)?.to_string();
    let target = parts.next().ok_or(ProtocolError::MalformedFrame)?.to_string();
    let version = parts.next().ok_or(ProtocolError::MalformedFrame)?.to_string();
    let headers = read_headers(reader).await?;
    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Parse a status-line and headers. Used by the HTTP data plane reading
/// the client's response off the same stream it sent the request on.
pub async fn read_response_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<ResponseHead, UpstreamError> {
    let line = read_line(reader)
        .await
        .map_err(|_| UpstreamError::BadResponse("missing status line".into()))?;
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| UpstreamError::BadResponse("missing HTTP version".into()))?
        .to_string();
    let status: u16 = parts
        .next()
        .ok_or_else(|| UpstreamError::BadResponse("missing status code".into()))?
        .parse()
        .map_err(|_| UpstreamError::BadResponse("non-numeric status code".into()))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = read_headers(reader)
        .await
        .map_err(|_| UpstreamError::BadResponse("malformed headers".into()))?;
    Ok(ResponseHead {
        status,
        reason,
        version,
        headers,
    })
}

pub async fn write_request_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    head: &RequestHead,
) -> std::io::Result<()> {
    let line = format!("{} {} {}\r\n", head.method, head.target, head.version);
    writer.write_all(line.as_bytes()).await?;
    for (name, value) in &head.headers {
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    writer.write_all(b"\r\n").await
}

pub async fn write_response_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    head: &ResponseHead,
) -> std::io::Result<()> {
    let line = format!("{} {} {}\r\n", head.version, head.status, head.reason);
    writer.write_all(line.as_bytes()).await?;
    for (name, value) in &head.headers {
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    writer.write_all(b"\r\n").await
}

/// Copy the body following a parsed head from `reader` to `writer`,
/// honoring `Content-Length` when present and otherwise copying until EOF
/// (safe here because every proxied request/response owns a fresh,
/// single-use stream; spec §4.6 step 8, §4.8).
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, length: BodyLength) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match length {
        BodyLength::Fixed(0) => Ok(0),
        BodyLength::Fixed(len) => tokio::io::copy(&mut reader.take(len), writer).await,
        BodyLength::UntilClose => tokio::io::copy(reader, writer).await,
    }
}

/// Build the synthetic `502 Bad Gateway` the client agent sends when the
/// local service can't be dialed (spec B4).
pub fn local_unavailable_response() -> (ResponseHead, &'static [u8]) {
    let body: &'static [u8] = b"Local service unavailable";
    let head = ResponseHead {
        version: "HTTP/1.1".to_string(),
        status: 502,
        reason: "Bad Gateway".to_string(),
        headers: vec![
            ("Content-Length".to_string(), body.len().to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Connection".to_string(), "close".to_string()),
        ],
    };
    (head, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_request_head_and_injects_xff() {
        let raw = b"GET /ping HTTP/1.1\r\nHost: alice.ex.io\r\nContent-Length: 0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/ping");
        assert_eq!(header_value(&head.headers, "host"), Some("alice.ex.io"));
        assert!(matches!(request_body_length(&head.headers), BodyLength::Fixed(0)));
    }

    #[tokio::test]
    async fn bodyless_request_without_content_length_is_zero() {
        let raw = b"GET /ping HTTP/1.1\r\nHost: alice.ex.io\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap();
        assert!(matches!(request_body_length(&head.headers), BodyLength::Fixed(0)));
    }

    #[tokio::test]
    async fn bodyless_response_without_content_length_runs_until_close() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert!(matches!(response_body_length(&head.headers), BodyLength::UntilClose));
    }

    #[tokio::test]
    async fn parses_response_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        let mut body = Vec::new();
        copy_body(&mut reader, &mut body, BodyLength::Fixed(4))
            .await
            .unwrap();
        assert_eq!(body, b"pong");
    }

    #[tokio::test]
    async fn rejects_malformed_header_line() {
        let raw = b"GET / HTTP/1.1\r\nnotaheader\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[test]
    fn synthesizes_502_body_b4() {
        let (head, body) = local_unavailable_response();
        assert_eq!(head.status, 502);
        assert_eq!(body, b"Local service unavailable");
    }
}
