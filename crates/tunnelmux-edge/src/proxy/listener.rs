//! Client-facing listener.
//!
//! Every accepted connection gets a fresh session id and its own read loop.
//! The read loop owns the read half of the socket; the write half is handed
//! to the dispatcher inside the `Accepted` event, so the only thing a read
//! loop ever does is turn client bytes into `local/data` events.

use super::resolver::DestinationResolver;
use crate::dispatcher::Event;
use crate::session::ClientHandle;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnelmux_core::{Message, MessageClass, TunnelError, TunnelResult};
use uuid::Uuid;

const BACKLOG: i32 = 1024;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ProxyListener {
    listener: TcpListener,
    resolver: Arc<dyn DestinationResolver>,
    events: mpsc::Sender<Event>,
    read_buffer_size: usize,
}

impl ProxyListener {
    /// Bind the listener. With `transparent` set the socket is marked
    /// `IP_TRANSPARENT` so it can accept connections addressed to foreign
    /// IPs; that needs `CAP_NET_ADMIN` and is Linux-only.
    pub fn bind(
        addr: &str,
        transparent: bool,
        resolver: Arc<dyn DestinationResolver>,
        events: mpsc::Sender<Event>,
        read_buffer_size: usize,
    ) -> TunnelResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| TunnelError::Config(format!("invalid listen address {addr}: {e}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if transparent {
            set_transparent(&socket)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!(addr = %addr, transparent, "proxy listener bound");

        Ok(Self {
            listener,
            resolver,
            events,
            read_buffer_size,
        })
    }

    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the dispatcher goes away.
    pub async fn accept_loop(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if self.events.is_closed() {
                        debug!("dispatcher stopped, ending accept loop");
                        break;
                    }
                    tokio::spawn(serve_client(
                        stream,
                        peer,
                        self.resolver.clone(),
                        self.events.clone(),
                        self.read_buffer_size,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &Socket) -> TunnelResult<()> {
    socket
        .set_ip_transparent(true)
        .map_err(|e| TunnelError::Config(format!("cannot set IP_TRANSPARENT (needs CAP_NET_ADMIN): {e}")))
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &Socket) -> TunnelResult<()> {
    Err(TunnelError::Config(
        "transparent mode is only supported on Linux".into(),
    ))
}

/// Per-client task: register the session, then pump client bytes into
/// `local/data` events until EOF, an error, or a close request.
async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    resolver: Arc<dyn DestinationResolver>,
    events: mpsc::Sender<Event>,
    read_buffer_size: usize,
) {
    let destination = match resolver.original_destination(&stream) {
        Ok(dest) => dest,
        Err(e) => {
            // Never registered, so dropping the stream is the whole cleanup.
            warn!(peer = %peer, error = %e, "closing client with unknown destination");
            return;
        }
    };

    let session_id = Uuid::new_v4().to_string();
    let _ = stream.set_nodelay(true);
    info!(session_id = %session_id, peer = %peer, destination = %destination, "client accepted");

    let (mut reader, writer) = stream.into_split();
    let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
    let accepted = Event::Accepted {
        message: Message::connect(MessageClass::Local, session_id.as_str(), destination.to_string()),
        client: ClientHandle::new(Box::new(writer), cancel_tx),
    };
    if events.send(accepted).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; read_buffer_size];
    loop {
        tokio::select! {
            signal = cancel_rx.recv() => {
                if signal.is_none() {
                    // The dispatcher dropped the handle without a session
                    // (refused id), so the id may belong to another client.
                    debug!(session_id = %session_id, "client refused");
                    return;
                }
                debug!(session_id = %session_id, "read loop cancelled");
                break;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(session_id = %session_id, "client closed");
                    break;
                }
                Ok(n) => {
                    let msg = Message::data(MessageClass::Local, session_id.as_str(), buf[..n].to_vec());
                    if events.send(Event::Local(msg)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "client read failed");
                    break;
                }
            },
        }
    }

    let _ = events
        .send(Event::Local(Message::disconnect(MessageClass::Local, session_id)))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;
    use tunnelmux_core::MessageType;

    const WAIT: Duration = Duration::from_secs(5);

    struct FixedResolver(SocketAddrV4);

    impl DestinationResolver for FixedResolver {
        fn original_destination(&self, _stream: &TcpStream) -> TunnelResult<SocketAddrV4> {
            Ok(self.0)
        }
    }

    struct FailingResolver;

    impl DestinationResolver for FailingResolver {
        fn original_destination(&self, _stream: &TcpStream) -> TunnelResult<SocketAddrV4> {
            Err(TunnelError::Destination("not intercepted".into()))
        }
    }

    async fn start(resolver: Arc<dyn DestinationResolver>) -> (SocketAddr, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let listener = ProxyListener::bind("127.0.0.1:0", false, resolver, tx, 4096).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.accept_loop());
        (addr, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn accepted_client_reports_connect_data_disconnect() {
        let (addr, mut rx) = start(Arc::new(FixedResolver("10.0.0.5:443".parse().unwrap()))).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // The handle stands in for the dispatcher's session entry; dropping
        // it would end the read loop.
        let (session_id, _handle) = match next_event(&mut rx).await {
            Event::Accepted { message, client } => {
                assert_eq!(message.class, MessageClass::Local);
                assert_eq!(message.kind, MessageType::Connect);
                assert_eq!(message.destination.as_deref(), Some("10.0.0.5:443"));
                assert_eq!(message.session_id.len(), 36);
                (message.session_id, client)
            }
            _ => panic!("expected accepted event"),
        };

        client.write_all(b"hello").await.unwrap();
        match next_event(&mut rx).await {
            Event::Local(msg) => {
                assert_eq!(msg.kind, MessageType::Data);
                assert_eq!(msg.session_id, session_id);
                assert_eq!(msg.payload, b"hello");
            }
            _ => panic!("expected local data"),
        }

        drop(client);
        match next_event(&mut rx).await {
            Event::Local(msg) => {
                assert_eq!(msg.kind, MessageType::Disconnect);
                assert_eq!(msg.session_id, session_id);
            }
            _ => panic!("expected local disconnect"),
        }
    }

    #[tokio::test]
    async fn every_client_gets_its_own_session_id() {
        let (addr, mut rx) = start(Arc::new(FixedResolver("10.0.0.5:443".parse().unwrap()))).await;
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();

        let mut ids = Vec::new();
        while ids.len() < 2 {
            if let Event::Accepted { message, .. } = next_event(&mut rx).await {
                ids.push(message.session_id);
            }
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn cancel_closes_read_loop() {
        let (addr, mut rx) = start(Arc::new(FixedResolver("10.0.0.5:443".parse().unwrap()))).await;
        let _client = TcpStream::connect(addr).await.unwrap();

        let (session_id, handle) = match next_event(&mut rx).await {
            Event::Accepted { message, client } => (message.session_id, client),
            _ => panic!("expected accepted event"),
        };
        handle.request_close();

        match next_event(&mut rx).await {
            Event::Local(msg) => {
                assert_eq!(msg.kind, MessageType::Disconnect);
                assert_eq!(msg.session_id, session_id);
            }
            _ => panic!("expected local disconnect"),
        }
    }

    #[tokio::test]
    async fn refused_client_is_closed_without_disconnect() {
        let (addr, mut rx) = start(Arc::new(FixedResolver("10.0.0.5:443".parse().unwrap()))).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let handle = match next_event(&mut rx).await {
            Event::Accepted { client, .. } => client,
            _ => panic!("expected accepted event"),
        };
        drop(handle);

        let mut buf = [0u8; 1];
        let n = timeout(WAIT, tokio::io::AsyncReadExt::read(&mut client, &mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        // The id is not reported closed; it may name another client's session.
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unresolvable_destination_is_closed_without_session() {
        let (addr, mut rx) = start(Arc::new(FailingResolver)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(WAIT, tokio::io::AsyncReadExt::read(&mut client, &mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_listen_address_is_a_config_error() {
        let (tx, _rx) = mpsc::channel(1);
        let result = ProxyListener::bind("not-an-addr", false, Arc::new(FailingResolver), tx, 4096);
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }
}
