//! A reverse tunnel service: a rendezvous server multiplexes many client
//! control connections and exposes each client's local service either as
//! an HTTP subdomain or a dedicated public TCP port.

pub mod client;
pub mod control;
pub mod error;
pub mod http_message;
pub mod http_plane;
pub mod identity;
pub mod ports;
pub mod registry;
pub mod server;
pub mod session;
pub mod tcp_plane;
pub mod wire;
