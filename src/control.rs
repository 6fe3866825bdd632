//! Control plane (component C5): the TLS-terminated listener that runs the
//! handshake state machine for each client session and holds the session
//! open for its lifetime.
//!
//! State machine (spec §4.5):
//! ```text
//! S0 AWAIT_CTRL_STREAM  -> S1 AWAIT_TOKEN -> S2 AUTHENTICATE
//!   -> S3 AWAIT_TUNNEL_KIND -> S4h/S4t REGISTER -> S5 HOLD -> CLOSE
//! ```
//! The registry must be mutated *before* the assignment line is written, so
//! the data plane can never observe a URL whose session isn't registered
//! yet (spec §4.5 rationale) — `register_http`/`register_tcp` insert first
//! and only then reply.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{info, info_span, warn, Instrument};
use yamux::Mode;

use crate::error::TransportError;
use crate::identity::IdentityVerifier;
use crate::ports::PortAllocator;
use crate::registry::{SharedRegistry, Tunnel};
use crate::session::{as_tokio_io, Session, SessionHandle};
use crate::tcp_plane;
use crate::wire::{read_json_value, write_line, ControlFrame, TunnelKind};

pub struct ControlPlane {
    pub domain: String,
    pub registry: SharedRegistry,
    pub identity: Arc<IdentityVerifier>,
    pub ports: Arc<PortAllocator>,
    pub public_bind_addr: IpAddr,
}

impl ControlPlane {
    /// Accept loop: one task per transport connection (spec §5 scheduling).
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: TlsAcceptor,
    ) -> Result<(), TransportError> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
            let this = Arc::clone(&self);
            let tls = tls.clone();
            let session_id = uuid::Uuid::new_v4();
            tokio::spawn(
                async move {
                    info!("incoming control connection");
                    match tls.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(err) = this.handle_connection(tls_stream).await {
                                warn!(%err, "control session exited with error");
                            } else {
                                info!("control session exited");
                            }
                        }
                        Err(err) => warn!(%err, "TLS handshake failed"),
                    }
                }
                .instrument(info_span!("control", %addr, %session_id)),
            );
        }
    }

    /// Runs the handshake state machine to completion, then closes the
    /// session unconditionally — every exit from `run_session`, success or
    /// `?`-propagated error alike, reaches CLOSE (spec §4.5: every state
    /// has an edge to CLOSE, not just the S5 HOLD success path).
    async fn handle_connection<T>(&self, io: T) -> anyhow::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new(io, Mode::Server);
        let result = self.run_session(&session).await;
        session.close_session();
        result
    }

    async fn run_session(&self, session: &SessionHandle) -> anyhow::Result<()> {
        // S0: the client's first stream is always the control stream.
        let ctrl_stream = session.accept_stream().await?;
        let mut ctrl = BufReader::new(as_tokio_io(ctrl_stream));

        // S1: auth token, a bare JSON string.
        let token: String = read_json_value(&mut ctrl).await?;

        // S2: authenticate. On failure, write the diagnostic and close
        // immediately — never fall through to `auth_ok` (spec §9 open
        // question resolution).
        let user = match self.identity.authenticate(&token).await {
            Ok(user) if user.allowed => user,
            _ => {
                write_line(&mut ctrl, "authentication failed: invalid or rejected token").await?;
                return Ok(());
            }
        };
        write_line(&mut ctrl, "auth_ok").await?;
        self.registry.reserve(&user.login);

        // S3: tunnel kind.
        let frame: ControlFrame = read_json_value(&mut ctrl).await?;
        let registered = match frame.kind {
            TunnelKind::Http => self.register_http(&mut ctrl, &user.login, session).await?,
            TunnelKind::Tcp => self.register_tcp(&mut ctrl, &user.login, session).await?,
        };

        // S5: HOLD. The control stream carries no further payload; its
        // closure is the only event that triggers deregistration.
        if let Some(id) = registered {
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut ctrl, &mut sink).await;
            if let Some(tunnel) = self.registry.remove(&user.login, &id) {
                tunnel.cancel_listener();
            }
        }

        Ok(())
    }

    async fn register_http<S>(
        &self,
        ctrl: &mut S,
        login: &str,
        session: &SessionHandle,
    ) -> anyhow::Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.registry.allocate_http_id(login);
        let tunnel = Tunnel::new_http(id.clone(), session.clone(), &self.domain);
        match self.registry.insert(login, tunnel) {
            Ok(()) => {
                write_line(ctrl, &format!("{id}.{}", self.domain)).await?;
                Ok(Some(id))
            }
            Err(quota) => {
                write_line(ctrl, &format!("err: {quota}")).await?;
                Ok(None)
            }
        }
    }

    async fn register_tcp<S>(
        &self,
        ctrl: &mut S,
        login: &str,
        session: &SessionHandle,
    ) -> anyhow::Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(quota) = self.registry.check_quota(login, TunnelKind::Tcp) {
            write_line(ctrl, &format!("err: {quota}")).await?;
            return Ok(None);
        }

        let id = self.registry.allocate_tcp_id(login);

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(_) => {
                write_line(ctrl, "error: could not allocate public port").await?;
                return Ok(None);
            }
        };

        let bind_addr = SocketAddr::new(self.public_bind_addr, port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%err, port, "failed to bind public TCP port");
                write_line(ctrl, "error: could not allocate public port").await?;
                return Ok(None);
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let tunnel = Tunnel::new_tcp(id.clone(), session.clone(), &self.domain, port, cancel_tx);
        match self.registry.insert(login, tunnel) {
            Ok(()) => {
                write_line(ctrl, &format!("{}:{port}", self.domain)).await?;
                let session = session.clone();
                tokio::spawn(
                    tcp_plane::run(listener, session, cancel_rx)
                        .instrument(info_span!("tcp-data-plane", port)),
                );
                Ok(Some(id))
            }
            Err(quota) => {
                write_line(ctrl, &format!("err: {quota}")).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::identity::IdentityVerifier;
    use crate::registry::TunnelRegistry;
    use crate::wire::read_line;

    /// A one-shot local HTTP server standing in for the identity provider,
    /// so `IdentityVerifier::authenticate` exercises a real `reqwest` round
    /// trip instead of being mocked away. Every connection gets the same
    /// fixed response, matching the teacher's own `identity.rs` comment
    /// about testing the network call against a local server.
    async fn spawn_mock_identity(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = conn.read(&mut buf).await;
                let reason = if status == 200 { "OK" } else { "Unauthorized" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = conn.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    fn test_control_plane(endpoint: String, ports: Arc<PortAllocator>) -> (Arc<ControlPlane>, SharedRegistry) {
        let registry: SharedRegistry = Arc::new(TunnelRegistry::new());
        let identity = Arc::new(IdentityVerifier::new(endpoint, String::new(), Duration::from_secs(5)));
        let control = Arc::new(ControlPlane {
            domain: "ex.io".to_string(),
            registry: Arc::clone(&registry),
            identity,
            ports,
            public_bind_addr: "127.0.0.1".parse().unwrap(),
        });
        (control, registry)
    }

    /// A rejected token must reply with the exact diagnostic line and never
    /// reach `auth_ok` (spec §9 open question: no fallthrough on failure).
    #[tokio::test]
    async fn auth_failure_replies_and_closes_without_auth_ok() {
        let endpoint = spawn_mock_identity(401, "unauthorized").await;
        let (control, _registry) = test_control_plane(endpoint, Arc::new(PortAllocator::new(40000, 40010)));

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Session::new(client_io, Mode::Client);

        let client_task = async move {
            let ctrl_stream = client.open_stream().await.unwrap();
            let mut ctrl = BufReader::new(as_tokio_io(ctrl_stream));
            write_line(&mut ctrl, &serde_json::to_string("some-token").unwrap())
                .await
                .unwrap();
            read_line(&mut ctrl).await.unwrap()
        };

        let (server_result, reply) = tokio::join!(control.handle_connection(server_io), client_task);
        assert!(server_result.is_ok());
        assert_eq!(reply, "authentication failed: invalid or rejected token");
    }

    /// S4t: quota is checked before a port is allocated, so a quota-exceeded
    /// TCP registration never advances the (never-recycled) port counter,
    /// and the caller sees the exact `err:` text `QuotaExceeded` renders.
    #[tokio::test]
    async fn tcp_quota_exceeded_before_port_allocation_never_consumes_a_port() {
        let endpoint = spawn_mock_identity(200, r#"{"id":1,"login":"carol","created_at":null}"#).await;
        let ports = Arc::new(PortAllocator::new(50000, 50010));
        // Warm the counter up by one so we can detect whether `register_tcp`
        // advanced it further.
        assert_eq!(ports.allocate().unwrap(), 50000);

        let (control, registry) = test_control_plane(endpoint, Arc::clone(&ports));
        registry.reserve("carol");
        registry
            .insert("carol", Tunnel::new_http("carol".into(), SessionHandle::new_for_test(), "ex.io"))
            .unwrap();
        registry
            .insert(
                "carol",
                Tunnel::new_http("carol-1".into(), SessionHandle::new_for_test(), "ex.io"),
            )
            .unwrap();

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Session::new(client_io, Mode::Client);

        let client_task = async move {
            let ctrl_stream = client.open_stream().await.unwrap();
            let mut ctrl = BufReader::new(as_tokio_io(ctrl_stream));
            write_line(&mut ctrl, &serde_json::to_string("carol-token").unwrap())
                .await
                .unwrap();
            let auth_reply = read_line(&mut ctrl).await.unwrap();
            assert_eq!(auth_reply, "auth_ok");
            let frame = ControlFrame { kind: TunnelKind::Tcp };
            write_line(&mut ctrl, &serde_json::to_string(&frame).unwrap())
                .await
                .unwrap();
            read_line(&mut ctrl).await.unwrap()
        };

        let (server_result, reply) = tokio::join!(control.handle_connection(server_io), client_task);
        assert!(server_result.is_ok());
        assert_eq!(reply, "err: max tcp tunnel limit reached (2)");
        assert_eq!(registry.tunnel_count("carol"), 2);
        // The quota check ran before `ports.allocate`, so the counter is
        // exactly where we left it.
        assert_eq!(ports.allocate().unwrap(), 50001);
    }

    /// I3: once an HTTP tunnel is registered, closing just the control
    /// stream (not the whole transport) must deregister it and leave the
    /// user with no tunnels.
    #[tokio::test]
    async fn closing_control_stream_deregisters_the_tunnel_i3() {
        let endpoint = spawn_mock_identity(200, r#"{"id":1,"login":"dave","created_at":null}"#).await;
        let (control, registry) = test_control_plane(endpoint, Arc::new(PortAllocator::new(41000, 41010)));

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Session::new(client_io, Mode::Client);
        let client_for_task = client.clone();

        let client_task = async move {
            let ctrl_stream = client_for_task.open_stream().await.unwrap();
            let mut ctrl = BufReader::new(as_tokio_io(ctrl_stream));
            write_line(&mut ctrl, &serde_json::to_string("dave-token").unwrap())
                .await
                .unwrap();
            assert_eq!(read_line(&mut ctrl).await.unwrap(), "auth_ok");
            let frame = ControlFrame { kind: TunnelKind::Http };
            write_line(&mut ctrl, &serde_json::to_string(&frame).unwrap())
                .await
                .unwrap();
            assert_eq!(read_line(&mut ctrl).await.unwrap(), "dave.ex.io");
            // Drop only the control stream; `client` (held by the outer
            // scope) keeps the session's driver running so the close is
            // actually flushed to the server side.
        };

        tokio::join!(control.handle_connection(server_io), client_task);

        assert_eq!(registry.tunnel_count("dave"), 0);
        assert!(registry.lookup("dave").is_none());
        drop(client);
    }
}
