//! TCP data plane (component C7): one public listener per TCP tunnel,
//! bridging each accepted connection to a fresh multiplexed stream.

use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, info_span, warn, Instrument};

use crate::session::{as_tokio_io, SessionHandle};

/// Accept loop for one TCP tunnel's public listener. Runs until the
/// listener errors or `cancel` fires (the owning control session closed).
pub async fn run(listener: TcpListener, session: SessionHandle, mut cancel: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut cancel => {
                info!("tcp tunnel cancelled, closing public listener");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((public_conn, addr)) => {
                        let session = session.clone();
                        tokio::spawn(
                            async move {
                                if let Err(err) = bridge(public_conn, &session).await {
                                    warn!(%err, "tcp bridge ended with error");
                                }
                            }
                            .instrument(info_span!("tcp-bridge", %addr)),
                        );
                    }
                    Err(err) => {
                        warn!(%err, "tcp public listener failed, ending tunnel");
                        return;
                    }
                }
            }
        }
    }
}

/// A fixed-size copy buffer bounds memory per direction (spec §9 fairness
/// & backpressure), so a slow peer in either direction back-propagates
/// pressure instead of letting us buffer unboundedly.
const COPY_BUFFER: usize = 32 * 1024;

async fn bridge<T>(public_conn: T, session: &SessionHandle) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mux_stream = session.open_stream().await?;
    let mux_io = as_tokio_io(mux_stream);

    let (mut pub_r, mut pub_w) = tokio::io::split(public_conn);
    let (mut mux_r, mut mux_w) = tokio::io::split(mux_io);

    let to_local = async {
        let mut buf = vec![0u8; COPY_BUFFER];
        loop_copy(&mut pub_r, &mut mux_w, &mut buf).await
    };
    let to_public = async {
        let mut buf = vec![0u8; COPY_BUFFER];
        loop_copy(&mut mux_r, &mut pub_w, &mut buf).await
    };

    let _ = tokio::join!(to_local, to_public);
    Ok(())
}

async fn loop_copy<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use tokio::net::{TcpListener as RealListener, TcpStream};
    use yamux::Mode;

    #[tokio::test]
    async fn bridges_bytes_both_ways_r3() {
        // Local service: echoes whatever it receives.
        let local_listener = RealListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = local_listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                conn.write_all(&buf[..n]).await.unwrap();
            }
        });

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client_session = Session::new(client_io, Mode::Client);
        let server_session = Session::new(server_io, Mode::Server);

        // The "client agent" side: accept streams from the server and
        // bridge them to the local echo service.
        let agent_session = client_session.clone();
        tokio::spawn(async move {
            loop {
                let Ok(stream) = agent_session.accept_stream().await else {
                    return;
                };
                let local = TcpStream::connect(local_addr).await.unwrap();
                let mut mux_io = as_tokio_io(stream);
                let mut local = local;
                let _ = tokio::io::copy_bidirectional(&mut mux_io, &mut local).await;
            }
        });

        let public_listener = RealListener::bind("127.0.0.1:0").await.unwrap();
        let public_addr = public_listener.local_addr().unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run(public_listener, server_session, cancel_rx));

        let mut public_peer = TcpStream::connect(public_addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        public_peer.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        public_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }
}
