//! Stream multiplexer (component C1): one reliable, ordered transport
//! carrying many independently open/closable byte streams.
//!
//! The original service (a Go program) multiplexed over `hashicorp/yamux`;
//! this wraps the Rust `yamux` crate (the same protocol family, maintained
//! alongside `libp2p`) behind the three operations spec.md describes and
//! nothing else: `open_stream`, `accept_stream`, `close_session`. Keep-alive
//! is left at its default-disabled setting, matching the original's
//! `EnableKeepAlive = false` — liveness is inferred purely from transport
//! closure (spec §4.1).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, warn};
use yamux::{Config, Connection, ConnectionError, Mode, Stream as YamuxStream};

use crate::error::TransportError;

/// A single multiplexed byte stream. Full-duplex, ordered, independently
/// closable; flow control is inherited from the multiplexer.
pub type MuxStream = YamuxStream;

/// A session owns one transport connection and the background task that
/// drives its multiplexer state machine. `yamux::Connection` must be polled
/// continuously for inbound streams and internal housekeeping to make
/// progress even while nothing is actively reading or writing, so the
/// driver runs on its own task and forwards accepted streams over a
/// channel.
pub struct Session {
    driver: JoinHandle<()>,
    inbound: Mutex<mpsc::Receiver<MuxStream>>,
    opener: mpsc::Sender<OpenRequest>,
}

struct OpenRequest {
    reply: tokio::sync::oneshot::Sender<Result<MuxStream, TransportError>>,
}

/// A cheaply cloneable handle to a session, stored in the tunnel registry.
#[derive(Clone)]
pub struct SessionHandle(Arc<Session>);

impl Session {
    /// Wrap an already-connected, already-authenticated transport. `mode`
    /// determines which side allocates odd vs even stream ids, per the
    /// multiplexer's framing contract.
    pub fn new<T>(io: T, mode: Mode) -> SessionHandle
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let socket: Compat<T> = io.compat();
        let mut config = Config::default();
        config.set_max_num_streams(usize::MAX);
        let mut conn = Connection::new(socket, config, mode);

        let (inbound_tx, inbound_rx) = mpsc::channel::<MuxStream>(32);
        let (open_tx, mut open_rx) = mpsc::channel::<OpenRequest>(32);

        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    req = open_rx.recv() => {
                        let Some(req) = req else { break };
                        let result = futures_util::future::poll_fn(|cx| conn.poll_new_outbound(cx))
                            .await
                            .map_err(map_conn_err);
                        let _ = req.reply.send(result);
                    }
                    inbound = futures_util::future::poll_fn(|cx| conn.poll_next_inbound(cx)) => {
                        match inbound {
                            Some(Ok(stream)) => {
                                if inbound_tx.send(stream).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                warn!(%err, "multiplexer session error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("session driver exited");
        });

        SessionHandle(Arc::new(Session {
            driver,
            inbound: Mutex::new(inbound_rx),
            opener: open_tx,
        }))
    }
}

impl SessionHandle {
    /// Initiator allocates a new stream id and opens it.
    pub async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.0
            .opener
            .send(OpenRequest { reply: reply_tx })
            .await
            .map_err(|_| TransportError::SessionClosed)?;
        reply_rx.await.map_err(|_| TransportError::SessionClosed)?
    }

    /// Blocks until the peer opens a stream on this session.
    pub async fn accept_stream(&self) -> Result<MuxStream, TransportError> {
        self.0
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::SessionClosed)
    }

    /// Closes the session, which atomically closes all its active streams
    /// with a terminal error (spec §4.1).
    pub fn close_session(&self) {
        self.0.driver.abort();
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        // A session over a loopback duplex pipe, used only so registry
        // tests can construct a `Tunnel` without a real network transport.
        let (a, _b) = tokio::io::duplex(64);
        Session::new(a, Mode::Client)
    }
}

/// Adapt a multiplexed stream (which speaks `futures::io`) to `tokio::io`,
/// so it can be used with `tokio::io::copy`, `BufReader`, etc.
pub fn as_tokio_io(stream: MuxStream) -> Compat<MuxStream> {
    stream.compat()
}

fn map_conn_err(err: ConnectionError) -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}
