//! Server supervisor (component C10): wires the tunnel registry, port
//! allocator, identity verifier, control plane, and HTTP data plane
//! together and runs both public listeners concurrently.
//!
//! Grounded in the teacher's `bore_cli::server::Server::listen`, and in
//! the original service's `Start()` (`internal/server/server.go`), which
//! launches the control-plane and HTTP-data-plane listeners as sibling
//! goroutines under one `WaitGroup`. Here that's `tokio::try_join!`: if
//! either plane's accept loop returns an error, the other is dropped and
//! the error propagates. There is no graceful drain (spec Non-goals).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::control::ControlPlane;
use crate::http_plane::HttpDataPlane;
use crate::identity::IdentityVerifier;
use crate::ports::PortAllocator;
use crate::registry::TunnelRegistry;

/// Configuration the binary's CLI gathers and hands to [`Server::new`]
/// (spec §4.10 configuration surface).
pub struct ServerSettings {
    pub domain: String,
    pub control_plane_addr: SocketAddr,
    pub data_plane_addr: SocketAddr,
    pub certificate_path: String,
    pub private_key_path: String,
    pub identity_provider_url: String,
    pub identity_token_prefix: String,
    pub identity_timeout: Duration,
    pub min_port: u16,
    pub max_port: u16,
}

pub struct Server {
    config: ServerSettings,
    registry: Arc<TunnelRegistry>,
    ports: Arc<PortAllocator>,
    identity: Arc<IdentityVerifier>,
}

impl Server {
    pub fn new(config: ServerSettings) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let ports = Arc::new(PortAllocator::new(config.min_port, config.max_port));
        let identity = Arc::new(IdentityVerifier::new(
            config.identity_provider_url.clone(),
            config.identity_token_prefix.clone(),
            config.identity_timeout,
        ));
        Server {
            config,
            registry,
            ports,
            identity,
        }
    }

    pub async fn listen(self) -> Result<()> {
        let tls = load_tls_acceptor(&self.config.certificate_path, &self.config.private_key_path)
            .context("failed to load TLS certificate/key")?;

        let control_listener = TcpListener::bind(self.config.control_plane_addr)
            .await
            .with_context(|| format!("failed to bind control plane at {}", self.config.control_plane_addr))?;
        let data_listener = TcpListener::bind(self.config.data_plane_addr)
            .await
            .with_context(|| format!("failed to bind HTTP data plane at {}", self.config.data_plane_addr))?;

        info!(
            control = %self.config.control_plane_addr,
            data = %self.config.data_plane_addr,
            domain = %self.config.domain,
            "server listening",
        );

        let control_plane = Arc::new(ControlPlane {
            domain: self.config.domain.clone(),
            registry: Arc::clone(&self.registry),
            identity: Arc::clone(&self.identity),
            ports: Arc::clone(&self.ports),
            public_bind_addr: self.config.data_plane_addr.ip(),
        });
        let http_plane = HttpDataPlane {
            registry: Arc::clone(&self.registry),
        };

        tokio::try_join!(
            async { control_plane.serve(control_listener, tls).await.map_err(anyhow::Error::from) },
            http_plane.serve(data_listener),
        )?;
        Ok(())
    }
}

fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open certificate file {cert_path}"))?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<_>>()
        .context("failed to parse certificate file")?;

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open private key file {key_path}"))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse private key file")?
        .context("no private key found in file")?;

    let config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
