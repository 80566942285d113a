//! Connection multiplexer shared by both tunnel ends.
//!
//! A [`Mux`] owns the per-connection bookkeeping for one WebSocket. The
//! socket loop feeds it inbound [`Frame`]s via [`Mux::handle_frame`] and
//! drains its outbound channel into the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{connect_allowed, ControlMessage, Frame};

/// Buffer size of the in-process pipe handed to dialers.
const PIPE_CAPACITY: usize = 64 * 1024;
/// Max bytes read from a local stream per data frame.
const READ_CHUNK: usize = 32 * 1024;
/// Queued data chunks per connection. A reader that falls further behind
/// has its connection reset.
const STREAM_QUEUE: usize = 256;

/// Failure to open a logical connection through a tunnel.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("{proto} connection to {address} is not allowed")]
    NotAllowed { proto: String, address: String },
    #[error("tunnel closed")]
    Closed,
    #[error("dial {address} timed out")]
    Timeout { address: String },
    #[error("dial {address} failed: {reason}")]
    Remote { address: String, reason: String },
}

/// Per-socket multiplexer state.
pub struct Mux {
    outbound: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u64, mpsc::Sender<Bytes>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>,
    next_id: AtomicU64,
    /// Agent side: honor `tunnel.connect` requests.
    accept_connects: bool,
    closed: CancellationToken,
}

impl Mux {
    pub fn new(outbound: mpsc::Sender<Frame>, accept_connects: bool) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accept_connects,
            closed: CancellationToken::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Mux::shutdown`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Open `address` on the far side and return the local end of the pipe.
    pub async fn dial(
        self: &Arc<Self>,
        proto: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<DuplexStream, DialError> {
        if !connect_allowed(proto, address) {
            return Err(DialError::NotAllowed {
                proto: proto.to_string(),
                address: address.to_string(),
            });
        }
        if self.is_closed() {
            return Err(DialError::Closed);
        }

        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        let (result_tx, result_rx) = oneshot::channel();

        // Register before asking so early data has somewhere to go.
        self.streams.lock().await.insert(conn_id, data_tx);
        self.pending.lock().await.insert(conn_id, result_tx);

        #[allow(clippy::cast_possible_truncation)]
        let connect = ControlMessage::Connect {
            conn_id,
            proto: proto.to_string(),
            address: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        if self.outbound.send(Frame::Control(connect)).await.is_err() {
            self.forget(conn_id).await;
            return Err(DialError::Closed);
        }

        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(None)) => {
                tokio::spawn(Arc::clone(self).pump(conn_id, remote, data_rx));
                Ok(local)
            }
            Ok(Ok(Some(reason))) => {
                self.streams.lock().await.remove(&conn_id);
                Err(DialError::Remote {
                    address: address.to_string(),
                    reason,
                })
            }
            Ok(Err(_)) => {
                self.forget(conn_id).await;
                Err(DialError::Closed)
            }
            Err(_) => {
                self.forget(conn_id).await;
                let _ = self
                    .outbound
                    .try_send(Frame::Control(ControlMessage::Close { conn_id }));
                Err(DialError::Timeout {
                    address: address.to_string(),
                })
            }
        }
    }

    /// Route one inbound frame. Ping/pong are the socket loop's business and
    /// are ignored here.
    pub async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Data(conn_id, data) => {
                let tx = self.streams.lock().await.get(&conn_id).cloned();
                let Some(tx) = tx else {
                    debug!(conn_id, "data for unknown connection dropped");
                    return;
                };
                // Never wait on one connection: the socket loop also carries
                // every other stream and the heartbeat.
                match tx.try_send(data) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(conn_id, "connection reader stalled, resetting it");
                        self.close_stream(conn_id).await;
                    }
                    Err(TrySendError::Closed(_)) => self.close_stream(conn_id).await,
                }
            }
            Frame::Control(ControlMessage::ConnectResult { conn_id, error }) => {
                if let Some(tx) = self.pending.lock().await.remove(&conn_id) {
                    let _ = tx.send(error);
                }
            }
            Frame::Control(ControlMessage::Close { conn_id }) => {
                self.streams.lock().await.remove(&conn_id);
            }
            Frame::Control(ControlMessage::Connect {
                conn_id,
                proto,
                address,
                timeout_ms,
            }) => {
                if self.accept_connects {
                    let mux = Arc::clone(self);
                    tokio::spawn(async move {
                        mux.accept_connect(conn_id, proto, address, Duration::from_millis(timeout_ms))
                            .await;
                    });
                } else {
                    warn!(conn_id, "unexpected tunnel.connect ignored");
                }
            }
            Frame::Control(ControlMessage::Ping | ControlMessage::Pong) => {}
        }
    }

    /// Agent side of `tunnel.connect`: dial locally, report, then pump.
    async fn accept_connect(
        self: Arc<Self>,
        conn_id: u64,
        proto: String,
        address: String,
        timeout: Duration,
    ) {
        if !connect_allowed(&proto, &address) {
            warn!(conn_id, %proto, %address, "refusing disallowed tunnel dial");
            self.reply(conn_id, Some(format!("{proto} connection to {address} is not allowed")))
                .await;
            return;
        }

        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        match proto.as_str() {
            "tcp" => {
                match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        self.streams.lock().await.insert(conn_id, data_tx);
                        self.reply(conn_id, None).await;
                        self.pump(conn_id, stream, data_rx).await;
                    }
                    Ok(Err(e)) => self.reply(conn_id, Some(e.to_string())).await,
                    Err(_) => self.reply(conn_id, Some("i/o timeout".to_string())).await,
                }
            }
            #[cfg(unix)]
            "unix" => {
                match tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&address)).await
                {
                    Ok(Ok(stream)) => {
                        self.streams.lock().await.insert(conn_id, data_tx);
                        self.reply(conn_id, None).await;
                        self.pump(conn_id, stream, data_rx).await;
                    }
                    Ok(Err(e)) => self.reply(conn_id, Some(e.to_string())).await,
                    Err(_) => self.reply(conn_id, Some("i/o timeout".to_string())).await,
                }
            }
            other => {
                self.reply(conn_id, Some(format!("{other} is not supported on this platform")))
                    .await;
            }
        }
    }

    async fn reply(&self, conn_id: u64, error: Option<String>) {
        let _ = self
            .outbound
            .send(Frame::Control(ControlMessage::ConnectResult { conn_id, error }))
            .await;
    }

    /// Copy bytes between `io` and the tunnel until either side closes.
    async fn pump<T>(self: Arc<Self>, conn_id: u64, io: T, mut inbound: mpsc::Receiver<Bytes>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                () = self.closed.cancelled() => break,
                n = reader.read(&mut buf) => match n {
                    Ok(0) | Err(_) => {
                        self.close_stream(conn_id).await;
                        break;
                    }
                    Ok(n) => {
                        let frame = Frame::Data(conn_id, Bytes::copy_from_slice(&buf[..n]));
                        if self.outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                },
                chunk = inbound.recv() => match chunk {
                    Some(data) => {
                        if writer.write_all(&data).await.is_err() {
                            self.close_stream(conn_id).await;
                            break;
                        }
                    }
                    // Far side closed.
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Drop local state for `conn_id` and tell the far side, once.
    async fn close_stream(&self, conn_id: u64) {
        if self.streams.lock().await.remove(&conn_id).is_some() {
            let _ = self
                .outbound
                .send(Frame::Control(ControlMessage::Close { conn_id }))
                .await;
        }
    }

    async fn forget(&self, conn_id: u64) {
        self.streams.lock().await.remove(&conn_id);
        self.pending.lock().await.remove(&conn_id);
    }

    /// Number of open logical connections.
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Fail pending dials and end every pump.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        self.streams.lock().await.clear();
        self.pending.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Wire two muxes back to back, as the socket loops would.
    fn pair() -> (Arc<Mux>, Arc<Mux>) {
        let (dialer_tx, mut dialer_rx) = mpsc::channel::<Frame>(64);
        let (agent_tx, mut agent_rx) = mpsc::channel::<Frame>(64);
        let dialer = Mux::new(dialer_tx, false);
        let agent = Mux::new(agent_tx, true);

        let to_agent = Arc::clone(&agent);
        tokio::spawn(async move {
            while let Some(frame) = dialer_rx.recv().await {
                to_agent.handle_frame(frame).await;
            }
        });
        let to_dialer = Arc::clone(&dialer);
        tokio::spawn(async move {
            while let Some(frame) = agent_rx.recv().await {
                to_dialer.handle_frame(frame).await;
            }
        });
        (dialer, agent)
    }

    #[tokio::test]
    async fn dial_echoes_through_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (dialer, _agent) = pair();
        let mut conn = dialer
            .dial("tcp", &addr, Duration::from_secs(5))
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn stalled_reader_does_not_block_other_streams() {
        let flood = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let flood_addr = flood.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = flood.accept().await.unwrap();
            let chunk = vec![0u8; 1 << 20];
            for _ in 0..16 {
                if sock.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            // Hold the socket open.
            std::future::pending::<()>().await;
        });
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (dialer, _agent) = pair();
        // Never read from.
        let _stalled = dialer
            .dial("tcp", &flood_addr, Duration::from_secs(5))
            .await
            .unwrap();
        for _ in 0..100 {
            if dialer.stream_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(dialer.stream_count().await, 0, "stalled connection was not reset");

        let mut conn = dialer
            .dial("tcp", &echo_addr, Duration::from_secs(5))
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn dial_reports_remote_failure() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let (dialer, _agent) = pair();
        let err = dialer
            .dial("tcp", &addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Remote { .. }), "{err}");
        assert_eq!(dialer.stream_count().await, 0);
    }

    #[tokio::test]
    async fn dial_rejects_disallowed_targets() {
        let (dialer, _agent) = pair();
        let err = dialer
            .dial("unix", "/etc/passwd", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::NotAllowed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_times_out_without_answer() {
        let (tx, _rx) = mpsc::channel::<Frame>(8);
        let mux = Mux::new(tx, false);
        let err = mux
            .dial("tcp", "10.0.0.1:80", Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Timeout { .. }));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_dials() {
        let (tx, _rx) = mpsc::channel::<Frame>(8);
        let mux = Mux::new(tx, false);
        let waiter = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.dial("tcp", "10.0.0.1:80", Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        while mux.pending.lock().await.is_empty() {
            tokio::task::yield_now().await;
        }
        mux.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Err(DialError::Closed)));
        assert!(mux.dial("tcp", "10.0.0.1:80", Duration::from_secs(1)).await.is_err());
    }
}
