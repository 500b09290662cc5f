//! Tunnel client: the single connection from the edge to the gateway.
//!
//! [`TunnelClient::run`] is the reconnect driver. Each successful connection
//! is split in two:
//!
//! - the write half is wrapped in a [`TunnelWriter`] and handed to the
//!   dispatcher through [`Event::TunnelUp`]; from then on the dispatcher is the
//!   only task that writes frames to the tunnel;
//! - the read half stays with the driver, which decodes frames and forwards
//!   them as [`Event::Downstream`] until the link fails.
//!
//! When the link fails the driver reports [`Event::TunnelDown`] and goes back
//! to connecting, retrying at a fixed interval for as long as the process
//! lives. Every connection is decoded from its first byte; nothing carries
//! over from a previous connection.

use crate::dispatcher::Event;
use crate::tls::TlsClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tunnelmux_core::{read_frame, write_frame, Message, MessageClass, TunnelError, TunnelResult};

/// Byte stream the tunnel runs over (plain TCP or TLS).
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Connection state of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the outbound connection to the gateway and its reconnect loop.
pub struct TunnelClient {
    server: String,
    tls: Option<TlsClient>,
    retry_interval: Duration,
    events: mpsc::Sender<Event>,
    state: Arc<watch::Sender<TunnelState>>,
}

impl TunnelClient {
    pub fn new(
        server: String,
        tls: Option<TlsClient>,
        retry_interval: Duration,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        Self {
            server,
            tls,
            retry_interval,
            events,
            state: Arc::new(state),
        }
    }

    /// Subscribe to tunnel state changes.
    pub fn state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// Open one transport connection to the gateway.
    pub async fn connect(&self) -> TunnelResult<TunnelStream> {
        let tcp = TcpStream::connect(&self.server)
            .await
            .map_err(|e| TunnelError::Transport(format!("connect to {} failed: {e}", self.server)))?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            None => Ok(Box::new(tcp)),
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| TunnelError::Tls(format!("handshake with {} failed: {e}", self.server)))?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Reconnect driver. Returns only when the dispatcher has gone away.
    pub async fn run(self) {
        let mut generation: u64 = 0;

        loop {
            self.state.send_replace(TunnelState::Connecting);
            let stream = match self.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        server = %self.server,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs_f64(),
                        "tunnel connect failed"
                    );
                    self.state.send_replace(TunnelState::Disconnected);
                    tokio::time::sleep(self.retry_interval).await;
                    continue;
                }
            };

            generation += 1;
            let connected_at = Instant::now();
            info!(server = %self.server, generation, "tunnel connected");

            let (reader, writer) = tokio::io::split(stream);
            let (lost_tx, lost_rx) = mpsc::channel::<()>(1);
            let tunnel_writer =
                TunnelWriter::new(Box::new(writer), generation, lost_tx, self.state.clone());

            self.state.send_replace(TunnelState::Connected);
            if self.events.send(Event::TunnelUp(tunnel_writer)).await.is_err() {
                debug!("dispatcher stopped, ending tunnel driver");
                break;
            }

            let reason = self.receive_loop(reader, lost_rx).await;
            self.state.send_replace(TunnelState::Disconnected);
            match reason {
                TunnelError::Closed => info!(generation, "tunnel closed by gateway"),
                e => error!(generation, error = %e, "tunnel lost"),
            }

            if self.events.send(Event::TunnelDown { generation }).await.is_err() {
                debug!("dispatcher stopped, ending tunnel driver");
                break;
            }

            // A link that dies right after connecting must not turn into a
            // tight reconnect loop.
            if connected_at.elapsed() < self.retry_interval {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
    }

    /// Decode frames until the link fails; returns why it stopped.
    async fn receive_loop(
        &self,
        mut reader: ReadHalf<TunnelStream>,
        mut lost_rx: mpsc::Receiver<()>,
    ) -> TunnelError {
        loop {
            tokio::select! {
                Some(()) = lost_rx.recv() => {
                    return TunnelError::Transport("tunnel write failed".into());
                }
                result = read_frame(&mut reader) => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(e) => return e,
                    };
                    if msg.class != MessageClass::Downstream {
                        warn!(
                            session_id = %msg.session_id,
                            class = %msg.class,
                            "gateway sent a frame not tagged downstream"
                        );
                    }
                    debug!(
                        session_id = %msg.session_id,
                        kind = %msg.kind,
                        length = msg.length(),
                        "frame from gateway"
                    );
                    let event = Event::Downstream(msg.with_class(MessageClass::Downstream));
                    if self.events.send(event).await.is_err() {
                        return TunnelError::Other("dispatcher stopped".into());
                    }
                }
            }
        }
    }
}

/// Write side of one tunnel connection, owned by the dispatcher.
pub struct TunnelWriter {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    generation: u64,
    lost: mpsc::Sender<()>,
    state: Arc<watch::Sender<TunnelState>>,
}

impl TunnelWriter {
    pub(crate) fn new(
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        generation: u64,
        lost: mpsc::Sender<()>,
        state: Arc<watch::Sender<TunnelState>>,
    ) -> Self {
        Self {
            writer,
            generation,
            lost,
            state,
        }
    }

    /// Which connection this writer belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Encode and write one frame.
    ///
    /// A failure marks the tunnel disconnected and tells the receive loop of
    /// the same connection to stop, so the driver reconnects.
    pub async fn send(&mut self, msg: &Message) -> TunnelResult<()> {
        match write_frame(&mut self.writer, msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(generation = self.generation, error = %e, "tunnel write failed");
                self.state.send_replace(TunnelState::Disconnected);
                let _ = self.lost.try_send(());
                Err(e)
            }
        }
    }
}
