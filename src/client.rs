//! Client agent (component C8): dials the server, performs the handshake,
//! and for each inbound stream either proxies an HTTP request to a local
//! service or bridges a raw TCP connection.
//!
//! Grounded in the teacher's `bore_cli::client::Client` for the outer
//! reconnect loop and per-stream dial-per-request shape, and in the
//! original service's `connectAndServe`/`handleProxyStream`
//! (`internal/client/client.go`) for the handshake sequence and the
//! fixed 5-second reconnect backoff (spec §4.8).

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{info, info_span, warn, Instrument};
use yamux::Mode;

use crate::http_message::{
    copy_body, local_unavailable_response, read_request_head, request_body_length,
    write_request_head, write_response_head,
};
use crate::session::{as_tokio_io, MuxStream, Session};
use crate::wire::{read_line, write_line, ControlFrame, TunnelKind, NETWORK_TIMEOUT, RECONNECT_BACKOFF};

pub struct Client {
    server_addr: String,
    auth_token: String,
    kind: TunnelKind,
    local_host: String,
    local_port: u16,
}

/// Ends the outer retry loop: an auth reply other than `auth_ok`, or a
/// `err:`/`error:` assignment reply, is fatal and must not be retried
/// (spec §9 open question resolution).
#[derive(Debug, thiserror::Error)]
#[error("fatal handshake failure: {0}")]
struct Terminal(String);

impl Client {
    pub fn new(
        server_addr: String,
        auth_token: String,
        kind: TunnelKind,
        local_host: String,
        local_port: u16,
    ) -> Self {
        Client {
            server_addr,
            auth_token,
            kind,
            local_host,
            local_port,
        }
    }

    /// Connect, run one session, and on any non-fatal error sleep 5 seconds
    /// and retry indefinitely (spec §4.8). Returns only on a fatal
    /// handshake failure or a clean session shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            match self.connect_and_serve().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is::<Terminal>() => return Err(err),
                Err(err) => {
                    warn!(%err, "connection error, retrying in 5 seconds");
                    sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    async fn connect_and_serve(&self) -> anyhow::Result<()> {
        let tcp = connect_with_timeout(&self.server_addr).await?;
        let session = Session::new(tcp, Mode::Client);

        let ctrl_stream = session.open_stream().await?;
        let mut ctrl = BufReader::new(as_tokio_io(ctrl_stream));

        write_line(&mut ctrl, &serde_json::to_string(&self.auth_token)?).await?;
        let auth_reply = read_line(&mut ctrl).await?;
        if auth_reply != "auth_ok" {
            println!("{auth_reply}");
            return Err(Terminal(auth_reply).into());
        }

        let frame = ControlFrame { kind: self.kind };
        write_line(&mut ctrl, &serde_json::to_string(&frame)?).await?;
        let assignment = read_line(&mut ctrl).await?;
        if assignment.starts_with("err:") || assignment.starts_with("error:") {
            println!("{assignment}");
            return Err(Terminal(assignment).into());
        }

        println!("forwarding {assignment} -> {}:{}", self.local_host, self.local_port);
        info!(assignment = %assignment, "tunnel established");

        loop {
            let stream = session.accept_stream().await?;
            let local_host = self.local_host.clone();
            let local_port = self.local_port;
            let kind = self.kind;
            tokio::spawn(
                async move {
                    let result = match kind {
                        TunnelKind::Http => handle_http_stream(stream, &local_host, local_port).await,
                        TunnelKind::Tcp => handle_tcp_stream(stream, &local_host, local_port).await,
                    };
                    if let Err(err) = result {
                        warn!(%err, "stream handling failed");
                    }
                }
                .instrument(info_span!("proxy")),
            );
        }
    }
}

async fn connect_with_timeout(addr: &str) -> anyhow::Result<TcpStream> {
    timeout(NETWORK_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to {addr}"))?
        .map_err(|err| anyhow::anyhow!("failed to connect to {addr}: {err}"))
}

/// One HTTP request per fresh stream (spec §4.6/§4.8): read it, dial the
/// local service, forward it, and copy the response back. On dial failure,
/// synthesize the `502` the public data plane expects (spec B4).
async fn handle_http_stream(stream: MuxStream, local_host: &str, local_port: u16) -> anyhow::Result<()> {
    let mut mux_reader = BufReader::new(as_tokio_io(stream));
    let request = read_request_head(&mut mux_reader).await?;
    let length = request_body_length(&request.headers);

    let local_addr = format!("{local_host}:{local_port}");
    let local_conn = match connect_with_timeout(&local_addr).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%err, %local_addr, "local service unavailable");
            let (head, body) = local_unavailable_response();
            let mut mux_io = mux_reader.into_inner();
            write_response_head(&mut mux_io, &head).await?;
            mux_io.write_all(body).await?;
            return Ok(());
        }
    };

    let (mut local_r, mut local_w) = local_conn.into_split();
    write_request_head(&mut local_w, &request).await?;
    copy_body(&mut mux_reader, &mut local_w, length).await?;
    local_w.shutdown().await.ok();

    let mut mux_io = mux_reader.into_inner();
    tokio::io::copy(&mut local_r, &mut mux_io).await?;
    Ok(())
}

/// A full-duplex bridge between the multiplexed stream and a freshly
/// dialed local connection; one per accepted public connection (spec §4.7).
async fn handle_tcp_stream(stream: MuxStream, local_host: &str, local_port: u16) -> anyhow::Result<()> {
    let mut mux_io = as_tokio_io(stream);
    let local_addr = format!("{local_host}:{local_port}");
    let mut local_conn = connect_with_timeout(&local_addr).await?;
    tokio::io::copy_bidirectional(&mut mux_io, &mut local_conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn fatal_replies_are_recognized() {
        let is_fatal = |line: &str| line.starts_with("err:") || line.starts_with("error:");
        assert!(is_fatal("err: max http tunnel limit reached (2)"));
        assert!(is_fatal("error: could not allocate public port"));
        assert!(!is_fatal("alice.ex.io"));
    }
}
