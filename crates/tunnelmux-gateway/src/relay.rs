//! Per-session relay to the real destination.
//!
//! Each `upstream/connect` spawns one relay task. The task dials the
//! destination, then moves bytes in both directions until either side
//! ends. Bytes from the edge arrive on an unbounded write channel, so data
//! that shows up while the dial is still in progress is simply queued.
//!
//! Downstream frames go straight onto the tunnel's outbound queue. A relay
//! that blocks there stalls only its own session; the session loop keeps
//! reading the tunnel.
//!
//! When the destination goes away the relay queues `downstream/disconnect`
//! itself and then reports its id on the `finished` channel so the session
//! loop can forget it. Dropping the [`RelayHandle`] is the close signal from
//! the other side: the task writes out whatever is still queued, shuts down
//! the destination socket and exits without sending anything.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnelmux_core::{Message, MessageClass};

/// The tunnel's end of a relay.
pub struct RelayHandle {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl RelayHandle {
    /// Queue bytes for the destination. Returns `false` once the relay task
    /// has ended.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.write_tx.send(data).is_ok()
    }
}

/// Where a relay sends its output.
#[derive(Clone)]
pub struct RelaySink {
    /// Frames for the edge.
    pub outbound: mpsc::Sender<Message>,
    /// Ids of relays whose destination is gone.
    pub finished: mpsc::UnboundedSender<String>,
}

/// Spawn a relay task for one session.
pub fn spawn(
    session_id: String,
    destination: String,
    connect_timeout: Duration,
    read_buffer_size: usize,
    sink: RelaySink,
) -> RelayHandle {
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let lost = run(
            &session_id,
            &destination,
            connect_timeout,
            read_buffer_size,
            write_rx,
            &sink.outbound,
        )
        .await;
        if lost {
            let _ = sink
                .outbound
                .send(Message::disconnect(MessageClass::Downstream, session_id.as_str()))
                .await;
            let _ = sink.finished.send(session_id.clone());
        }
        debug!(session_id = %session_id, "relay ended");
    });
    RelayHandle { write_tx }
}

/// Returns `true` when the destination side ended the session, `false`
/// when the edge did or the tunnel is gone.
async fn run(
    session_id: &str,
    destination: &str,
    connect_timeout: Duration,
    read_buffer_size: usize,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: &mpsc::Sender<Message>,
) -> bool {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(destination)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(session_id, destination, error = %e, "destination connect failed");
            return true;
        }
        Err(_) => {
            warn!(session_id, destination, "destination connect timed out");
            return true;
        }
    };
    let _ = stream.set_nodelay(true);
    info!(session_id, destination, "destination connected");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; read_buffer_size];

    let lost = loop {
        tokio::select! {
            // An edge close wins over a pending read so no data follows it.
            biased;
            data = write_rx.recv() => {
                let Some(data) = data else {
                    debug!(session_id, "edge closed session");
                    break false;
                };
                if let Err(e) = write_half.write_all(&data).await {
                    warn!(session_id, error = %e, "destination write error");
                    break true;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        info!(session_id, "destination closed");
                        break true;
                    }
                    Ok(n) => {
                        let msg = Message::data(MessageClass::Downstream, session_id, buf[..n].to_vec());
                        if outbound.send(msg).await.is_err() {
                            debug!(session_id, "tunnel gone, ending relay");
                            break false;
                        }
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "destination read error");
                        break true;
                    }
                }
            }
        }
    };

    let _ = write_half.shutdown().await;
    lost
}
