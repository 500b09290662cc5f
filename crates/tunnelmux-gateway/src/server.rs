//! Tunnel server.
//!
//! Every accepted tunnel connection is served by three parts:
//!
//! - a reader task that decodes frames and queues them,
//! - a writer task that owns the write half and drains the outbound queue,
//! - the session loop, which owns the relay map and is the only code that
//!   touches it.
//!
//! Relays put their downstream frames on the outbound queue themselves.
//!
//! Frame decoding runs in its own task so the session loop can wait on
//! frames and relay events together without ever abandoning a half-read
//! frame.

use crate::relay::{self, RelayHandle, RelaySink};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tunnelmux_core::{read_frame, write_frame, Message, MessageClass, MessageType, TunnelError, TunnelResult};

/// Per-tunnel settings shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
}

pub struct GatewayServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    settings: TunnelSettings,
}

impl GatewayServer {
    pub async fn bind(addr: &str, tls: Option<TlsAcceptor>, settings: TunnelSettings) -> TunnelResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::Transport(format!("cannot bind {addr}: {e}")))?;
        info!(addr, tls = tls.is_some(), "gateway listening");
        Ok(Self {
            listener,
            tls,
            settings,
        })
    }

    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel connections forever.
    pub async fn accept_loop(self) {
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);
            let tls = self.tls.clone();
            let settings = self.settings;

            tokio::spawn(async move {
                info!(peer = %peer, "tunnel accepted");
                match tls {
                    None => serve_tunnel(tcp, settings).await,
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(stream) => serve_tunnel(stream, settings).await,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                }
                info!(peer = %peer, "tunnel closed");
            });
        }
    }
}

/// Serve one tunnel connection until it fails or the edge disconnects.
pub async fn serve_tunnel<S>(stream: S, settings: TunnelSettings)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Message>(settings.queue_capacity);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(msg) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(TunnelError::Closed) => {
                    debug!("edge closed tunnel");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "tunnel read failed");
                    break;
                }
            }
        }
    });

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(settings.queue_capacity);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &msg).await {
                error!(error = %e, "tunnel write failed");
                break;
            }
        }
    });

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<String>();
    let sink = RelaySink {
        outbound: outbound_tx,
        finished: finished_tx,
    };
    let mut relays: HashMap<String, RelayHandle> = HashMap::new();

    // Nothing in this loop waits on the outbound queue, so a slow edge never
    // stops the tunnel from being read.
    loop {
        tokio::select! {
            msg = inbound_rx.recv() => {
                let Some(msg) = msg else { break };
                on_frame(msg, &mut relays, &sink, &settings);
            }
            Some(session_id) = finished_rx.recv() => {
                relays.remove(&session_id);
            }
        }
    }

    if !relays.is_empty() {
        info!(count = relays.len(), "closing relays of lost tunnel");
    }
    drop(relays);
    drop(sink);
    reader_task.abort();
    let _ = writer_task.await;
}

/// Apply one frame from the edge.
fn on_frame(
    msg: Message,
    relays: &mut HashMap<String, RelayHandle>,
    sink: &RelaySink,
    settings: &TunnelSettings,
) {
    if msg.class != MessageClass::Upstream {
        warn!(session_id = %msg.session_id, class = %msg.class, "edge sent a frame not tagged upstream");
    }

    match msg.kind {
        MessageType::Connect => {
            let Some(destination) = msg.destination else {
                warn!(session_id = %msg.session_id, "connect without destination");
                let reply = Message::disconnect(MessageClass::Downstream, msg.session_id);
                if sink.outbound.try_send(reply).is_err() {
                    warn!("outbound queue full, dropping disconnect reply");
                }
                return;
            };
            if relays.contains_key(&msg.session_id) {
                warn!(session_id = %msg.session_id, "duplicate connect, ignoring");
                return;
            }
            info!(session_id = %msg.session_id, destination = %destination, "opening relay");
            let handle = relay::spawn(
                msg.session_id.clone(),
                destination,
                settings.connect_timeout,
                settings.read_buffer_size,
                sink.clone(),
            );
            relays.insert(msg.session_id, handle);
        }
        MessageType::Data => match relays.get(&msg.session_id) {
            Some(handle) => {
                if !handle.send(msg.payload) {
                    debug!(session_id = %msg.session_id, "relay already ended");
                }
            }
            None => {
                warn!(session_id = %msg.session_id, length = msg.length(), "data for unknown session, dropping");
            }
        },
        MessageType::Disconnect => {
            if relays.remove(&msg.session_id).is_some() {
                debug!(session_id = %msg.session_id, "edge closed session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;
    use rustls::pki_types::{CertificateDer, ServerName};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings() -> TunnelSettings {
        TunnelSettings {
            connect_timeout: WAIT,
            queue_capacity: 64,
            read_buffer_size: 4096,
        }
    }

    async fn start(tls: Option<TlsAcceptor>) -> SocketAddr {
        let server = GatewayServer::bind("127.0.0.1:0", tls, settings()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.accept_loop());
        addr
    }

    async fn next_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Message {
        timeout(WAIT, read_frame(reader)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn session_round_trip_through_destination() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let gateway = start(None).await;
        let mut tunnel = TcpStream::connect(gateway).await.unwrap();

        write_frame(&mut tunnel, &Message::connect(MessageClass::Upstream, "X", dest_addr.as_str()))
            .await
            .unwrap();
        let payload: Vec<u8> = (0..100u8).collect();
        write_frame(&mut tunnel, &Message::data(MessageClass::Upstream, "X", payload.clone()))
            .await
            .unwrap();

        let (mut remote, _) = timeout(WAIT, dest.accept()).await.unwrap().unwrap();
        let mut got = vec![0u8; 100];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);

        remote.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        let reply = next_frame(&mut tunnel).await;
        assert_eq!(reply.class, MessageClass::Downstream);
        assert_eq!(reply.kind, MessageType::Data);
        assert_eq!(reply.session_id, "X");
        assert_eq!(reply.payload, b"HTTP/1.1 200 OK\r\n\r\n");

        drop(remote);
        let bye = next_frame(&mut tunnel).await;
        assert_eq!(bye.kind, MessageType::Disconnect);
        assert_eq!(bye.session_id, "X");
    }

    #[tokio::test]
    async fn unreachable_destination_reports_disconnect() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = closed.local_addr().unwrap().to_string();
        drop(closed);

        let gateway = start(None).await;
        let mut tunnel = TcpStream::connect(gateway).await.unwrap();
        write_frame(&mut tunnel, &Message::connect(MessageClass::Upstream, "Y", dest_addr.as_str()))
            .await
            .unwrap();

        let reply = next_frame(&mut tunnel).await;
        assert_eq!(reply.kind, MessageType::Disconnect);
        assert_eq!(reply.session_id, "Y");
    }

    #[tokio::test]
    async fn edge_disconnect_closes_destination_without_echo() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let gateway = start(None).await;
        let mut tunnel = TcpStream::connect(gateway).await.unwrap();

        write_frame(&mut tunnel, &Message::connect(MessageClass::Upstream, "Z", dest_addr.as_str()))
            .await
            .unwrap();
        let (mut remote, _) = timeout(WAIT, dest.accept()).await.unwrap().unwrap();
        write_frame(&mut tunnel, &Message::disconnect(MessageClass::Upstream, "Z"))
            .await
            .unwrap();

        let mut buf = Vec::new();
        timeout(WAIT, remote.read_to_end(&mut buf)).await.unwrap().unwrap();
        assert!(buf.is_empty());

        // Nothing comes back for Z.
        let mut byte = [0u8; 1];
        assert!(timeout(Duration::from_millis(200), tunnel.read(&mut byte)).await.is_err());
    }

    #[tokio::test]
    async fn data_for_unknown_session_is_ignored() {
        let gateway = start(None).await;
        let mut tunnel = TcpStream::connect(gateway).await.unwrap();
        write_frame(&mut tunnel, &Message::data(MessageClass::Upstream, "ghost", b"boo".to_vec()))
            .await
            .unwrap();

        let mut byte = [0u8; 1];
        assert!(timeout(Duration::from_millis(200), tunnel.read(&mut byte)).await.is_err());
    }

    #[tokio::test]
    async fn tunnel_loss_closes_relays() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let gateway = start(None).await;
        let mut tunnel = TcpStream::connect(gateway).await.unwrap();

        write_frame(&mut tunnel, &Message::connect(MessageClass::Upstream, "L", dest_addr.as_str()))
            .await
            .unwrap();
        let (mut remote, _) = timeout(WAIT, dest.accept()).await.unwrap().unwrap();
        drop(tunnel);

        let mut buf = Vec::new();
        timeout(WAIT, remote.read_to_end(&mut buf)).await.unwrap().unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn keeps_reading_tunnel_while_edge_is_not_draining() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let tight = TunnelSettings {
            queue_capacity: 2,
            ..settings()
        };
        let server = GatewayServer::bind("127.0.0.1:0", None, tight).await.unwrap();
        let gateway = server.local_addr().unwrap();
        tokio::spawn(server.accept_loop());
        let mut tunnel = TcpStream::connect(gateway).await.unwrap();

        write_frame(&mut tunnel, &Message::connect(MessageClass::Upstream, "F", dest_addr.as_str()))
            .await
            .unwrap();
        let (remote, _) = timeout(WAIT, dest.accept()).await.unwrap().unwrap();
        let (mut remote_rd, mut remote_wr) = remote.into_split();

        // The destination floods the edge, which never reads the tunnel.
        let flood = tokio::spawn(async move {
            let chunk = vec![0x5au8; 64 * 1024];
            while remote_wr.write_all(&chunk).await.is_ok() {}
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let chunk = vec![0xa5u8; 1024];
        for _ in 0..256 {
            let msg = Message::data(MessageClass::Upstream, "F", chunk.clone());
            timeout(WAIT, write_frame(&mut tunnel, &msg)).await.unwrap().unwrap();
        }
        let mut got = vec![0u8; 256 * 1024];
        timeout(WAIT, remote_rd.read_exact(&mut got)).await.unwrap().unwrap();
        assert!(got.iter().all(|b| *b == 0xa5));
        flood.abort();
    }

    #[tokio::test]
    async fn relays_over_tls() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = tls::generate_self_signed_cert(dir.path()).unwrap();
        let acceptor = tls::load_acceptor(&cert_path, &key_path).unwrap();

        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let gateway = start(Some(acceptor)).await;

        let pem = std::fs::read(&cert_path).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert: CertificateDer<'static> = cert.unwrap();
            roots.add(cert).unwrap();
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(gateway).await.unwrap();
        let mut tunnel = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();

        write_frame(&mut tunnel, &Message::connect(MessageClass::Upstream, "T", dest_addr.as_str()))
            .await
            .unwrap();
        let (mut remote, _) = timeout(WAIT, dest.accept()).await.unwrap().unwrap();
        remote.write_all(b"secret").await.unwrap();

        let reply = next_frame(&mut tunnel).await;
        assert_eq!(reply.session_id, "T");
        assert_eq!(reply.payload, b"secret");
    }
}
