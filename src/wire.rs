//! Shared wire vocabulary for the control stream (component C9).
//!
//! The control stream carries two JSON values sent by the client (the auth
//! token, then a [`ControlFrame`]) followed by newline-terminated plain text
//! replies from the server. This asymmetry is deliberate: it lets the server
//! reply with a human-readable diagnostic even when no further JSON exchange
//! is useful, and it must be preserved for compatibility with existing
//! clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ProtocolError;

/// Network timeout applied to dialing the control plane and to the identity
/// verifier's HTTPS call.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed backoff between client reconnect attempts (spec: no jitter, no
/// exponential growth).
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on a single JSON control value, to bound memory use if a peer
/// never terminates a value.
const MAX_JSON_FRAME: usize = 16 * 1024;

/// The tunnel kind negotiated after authentication.
///
/// A closed, two-variant tag: everywhere this dispatches, match on it
/// directly rather than comparing strings. The wire format still encodes it
/// as the literal strings `"http"` / `"tcp"` for compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Tcp,
}

impl TunnelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelKind::Http => "http",
            TunnelKind::Tcp => "tcp",
        }
    }
}

/// `{ "type": "http" | "tcp" }`, sent by the client after authenticating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: TunnelKind,
}

/// Read one complete JSON value from an async byte stream without relying on
/// a delimiter, by growing a buffer and re-attempting a parse each time new
/// bytes arrive until `serde_json` reports the buffer holds a complete value.
pub async fn read_json_value<T, R>(reader: &mut R) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match serde_json::from_slice::<T>(&buf) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_eof() => {
                if buf.len() >= MAX_JSON_FRAME {
                    return Err(ProtocolError::FrameTooLarge);
                }
                let n = reader
                    .read(&mut byte)
                    .await
                    .map_err(|_| ProtocolError::UnexpectedEof)?;
                if n == 0 {
                    return Err(ProtocolError::UnexpectedEof);
                }
                buf.push(byte[0]);
            }
            Err(_) if buf.iter().all(|b| b.is_ascii_whitespace()) => {
                let n = reader
                    .read(&mut byte)
                    .await
                    .map_err(|_| ProtocolError::UnexpectedEof)?;
                if n == 0 {
                    return Err(ProtocolError::UnexpectedEof);
                }
                buf.push(byte[0]);
            }
            Err(_) => return Err(ProtocolError::MalformedFrame),
        }
    }
}

/// Write a single newline-terminated text line (a server reply).
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> Result<(), ProtocolError> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    Ok(())
}

/// Read a single newline-terminated text line (a server reply), with the
/// trailing newline stripped. Used by the client.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String, ProtocolError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    if n == 0 {
        return Err(ProtocolError::UnexpectedEof);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_json_string_token() {
        let mut cursor = Cursor::new(b"\"my-token\"".to_vec());
        let token: String = read_json_value(&mut cursor).await.unwrap();
        assert_eq!(token, "my-token");
    }

    #[tokio::test]
    async fn reads_control_frame() {
        let mut cursor = Cursor::new(br#"{"type":"tcp"}"#.to_vec());
        let frame: ControlFrame = read_json_value(&mut cursor).await.unwrap();
        assert_eq!(frame.kind, TunnelKind::Tcp);
    }

    #[tokio::test]
    async fn rejects_malformed_frame() {
        let mut cursor = Cursor::new(b"{not json}".to_vec());
        let result: Result<ControlFrame, _> = read_json_value(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reads_and_writes_lines() {
        let mut buf = Vec::new();
        write_line(&mut buf, "auth_ok").await.unwrap();
        assert_eq!(buf, b"auth_ok\n");

        let mut reader = BufReader::new(Cursor::new(b"hello.example.com\n".to_vec()));
        let line = read_line(&mut reader).await.unwrap();
        assert_eq!(line, "hello.example.com");
    }

    #[test]
    fn tunnel_kind_wire_strings() {
        assert_eq!(TunnelKind::Http.as_str(), "http");
        assert_eq!(TunnelKind::Tcp.as_str(), "tcp");
        let frame: ControlFrame = serde_json::from_str(r#"{"type":"http"}"#).unwrap();
        assert_eq!(frame.kind, TunnelKind::Http);
    }
}
