use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relaytun::client::Client;
use relaytun::server::{Server, ServerSettings};
use relaytun::wire::TunnelKind;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the client agent, forwarding a local service through the server.
    Local {
        /// The local port to expose.
        #[clap(env = "RELAYTUN_LOCAL_PORT")]
        local_port: u16,

        /// The local host to expose.
        #[clap(long, value_name = "HOST", default_value = "localhost")]
        local_host: String,

        /// Address of the control plane to connect to (host:port).
        #[clap(short, long, env = "RELAYTUN_SERVER")]
        to: String,

        /// Tunnel kind to request: "http" or "tcp".
        #[clap(short, long, default_value = "http")]
        kind: String,

        /// Bearer token presented to the identity provider.
        #[clap(short, long, env = "RELAYTUN_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Runs the server: the control plane and the public HTTP data plane.
    Server {
        /// Base domain assigned to HTTP subdomains and shown for TCP tunnels.
        #[clap(long, env = "RELAYTUN_DOMAIN")]
        domain: String,

        /// Address the control plane (TLS) listens on.
        #[clap(long, default_value = "0.0.0.0:7835", env = "RELAYTUN_CONTROL_ADDR")]
        control_addr: SocketAddr,

        /// Address the public HTTP data plane listens on.
        #[clap(long, default_value = "0.0.0.0:443", env = "RELAYTUN_DATA_ADDR")]
        data_addr: SocketAddr,

        /// IP address TCP tunnel listeners bind to; defaults to the data
        /// plane's address.
        #[clap(long)]
        bind_tunnels: Option<IpAddr>,

        /// Minimum public TCP tunnel port.
        #[clap(long, default_value_t = 30000, env = "RELAYTUN_MIN_PORT")]
        min_port: u16,

        /// Maximum public TCP tunnel port.
        #[clap(long, default_value_t = 65535, env = "RELAYTUN_MAX_PORT")]
        max_port: u16,

        /// TLS certificate (PEM) path.
        #[clap(long, env = "RELAYTUN_CERT_PATH")]
        cert_path: String,

        /// TLS private key (PEM) path.
        #[clap(long, env = "RELAYTUN_KEY_PATH")]
        key_path: String,

        /// Identity provider endpoint queried to validate bearer tokens.
        #[clap(long, env = "RELAYTUN_IDENTITY_URL")]
        identity_url: String,

        /// Prefix prepended to the bearer token in the Authorization header.
        #[clap(long, default_value = "", env = "RELAYTUN_IDENTITY_TOKEN_PREFIX")]
        identity_token_prefix: String,

        /// Timeout, in seconds, for the identity provider HTTP call.
        #[clap(long, default_value_t = 10, env = "RELAYTUN_IDENTITY_TIMEOUT_SECS")]
        identity_timeout_secs: u64,
    },
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Local {
            local_host,
            local_port,
            to,
            kind,
            token,
        } => {
            let kind = match kind.as_str() {
                "http" => TunnelKind::Http,
                "tcp" => TunnelKind::Tcp,
                other => anyhow::bail!("unknown tunnel kind {other:?}, expected \"http\" or \"tcp\""),
            };
            let client = Client::new(to, token, kind, local_host, local_port);
            client.run().await?;
        }
        Command::Server {
            domain,
            control_addr,
            data_addr,
            bind_tunnels,
            min_port,
            max_port,
            cert_path,
            key_path,
            identity_url,
            identity_token_prefix,
            identity_timeout_secs,
        } => {
            if min_port > max_port {
                anyhow::bail!("--min-port must be <= --max-port");
            }
            let tunnel_bind_ip = bind_tunnels.unwrap_or_else(|| data_addr.ip());
            let data_plane_addr = SocketAddr::new(tunnel_bind_ip, data_addr.port());
            let server = Server::new(ServerSettings {
                domain,
                control_plane_addr: control_addr,
                data_plane_addr,
                certificate_path: cert_path,
                private_key_path: key_path,
                identity_provider_url: identity_url,
                identity_token_prefix,
                identity_timeout: Duration::from_secs(identity_timeout_secs),
                min_port,
                max_port,
            });
            server.listen().await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run(Args::parse().command).await
}
