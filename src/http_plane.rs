//! HTTP data plane (component C6): the public HTTP listener that routes by
//! `Host` header and proxies each request over a fresh multiplexed stream.
//!
//! Grounded directly in the original service's `proxyHandler`
//! (`internal/server/data_plane.go`): split `Host` on `.`, reject fewer
//! than three labels with 400, look the leftmost label up in the registry,
//! open one stream per request, write the request, read the response back.
//! Rewritten here with hand-rolled HTTP/1.1 framing (`http_message.rs`)
//! instead of a web framework, so headers and body pass through unchanged
//! (round-trip laws R1/R2).

use std::net::SocketAddr;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, warn, Instrument};

use crate::http_message::{
    copy_body, header_value, read_request_head, request_body_length, response_body_length,
    write_request_head, RequestHead,
};
use crate::registry::SharedRegistry;
use crate::session::as_tokio_io;

pub struct HttpDataPlane {
    pub registry: SharedRegistry,
}

impl HttpDataPlane {
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (conn, addr) = listener.accept().await?;
            tokio::spawn(
                self.handle(conn, addr)
                    .instrument(info_span!("http-data-plane", %addr)),
            );
        }
    }

    async fn handle(&self, conn: TcpStream, addr: SocketAddr) {
        if let Err(err) = self.proxy_one(conn, addr).await {
            warn!(%err, "request handling failed");
        }
    }

    async fn proxy_one(&self, conn: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let mut conn = BufReader::new(conn);
        let mut request = match read_request_head(&mut conn).await {
            Ok(head) => head,
            Err(_) => {
                respond_error(conn.get_mut(), 400, "Bad Request").await?;
                return Ok(());
            }
        };

        let host = header_value(&request.headers, "host")
            .map(str::to_string)
            .unwrap_or_default();
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 3 {
            respond_error(conn.get_mut(), 400, "Bad Request").await?;
            return Ok(());
        }
        let tunnel_id = labels[0].to_string();

        let session = match self.registry.lookup(&tunnel_id) {
            Some(session) => session,
            None => {
                let body = format!(
                    "subdomain for client_id: {tunnel_id} not found in the registry, or client has disconnected"
                );
                respond_error_body(conn.get_mut(), 404, "Not Found", &body).await?;
                return Ok(());
            }
        };

        let mux_stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(_) => {
                respond_error(conn.get_mut(), 500, "Internal Server Error").await?;
                return Ok(());
            }
        };
        let mut mux_io = as_tokio_io(mux_stream);

        inject_forwarded_for(&mut request, addr);

        write_request_head(&mut mux_io, &request).await?;
        let length = request_body_length(&request.headers);
        copy_body(&mut conn, &mut mux_io, length).await?;

        let mut mux_reader = BufReader::new(mux_io);
        let response = match crate::http_message::read_response_head(&mut mux_reader).await {
            Ok(head) => head,
            Err(_) => {
                respond_error(conn.get_mut(), 502, "Bad Gateway").await?;
                return Ok(());
            }
        };

        crate::http_message::write_response_head(conn.get_mut(), &response).await?;
        let resp_length = response_body_length(&response.headers);
        copy_body(&mut mux_reader, conn.get_mut(), resp_length).await?;
        conn.get_mut().flush().await?;

        info!(%tunnel_id, status = response.status, "request proxied");
        Ok(())
    }
}

/// Preserve the public client IP: only set `X-Forwarded-For` when the
/// client didn't already provide one (spec §4.6 step 5).
fn inject_forwarded_for(request: &mut RequestHead, addr: SocketAddr) {
    if header_value(&request.headers, "x-forwarded-for").is_some() {
        return;
    }
    request
        .headers
        .push(("X-Forwarded-For".to_string(), addr.ip().to_string()));
}

async fn respond_error(conn: &mut TcpStream, status: u16, reason: &str) -> std::io::Result<()> {
    respond_error_body(conn, status, reason, reason).await
}

async fn respond_error_body(
    conn: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(response.as_bytes()).await
}
