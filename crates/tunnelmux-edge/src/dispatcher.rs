//! Event dispatcher.
//!
//! A single task drains the event queue in FIFO order. It is the only owner
//! of the [`SessionTable`] and the only writer to the tunnel, so neither
//! needs a lock: every other task talks to it by sending an [`Event`].
//!
//! Session transitions:
//!
//! ```text
//! local/connect        → create (Connected), send upstream/connect
//! local/data           → send upstream/data
//! local/disconnect     → upstream/disconnect if still Connected, remove
//! downstream/data      → write payload to the client
//! downstream/disconnect→ DisconnectPending, signal the client read loop
//! ```

use crate::session::{ClientHandle, SessionStatus, SessionTable};
use crate::tunnel::TunnelWriter;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tunnelmux_core::{Message, MessageClass, MessageType};

/// Longest a single write to a client may stall the dispatcher.
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the dispatcher reacts to.
pub enum Event {
    /// A client was accepted; carries the `local/connect` message and the
    /// client's write side.
    Accepted {
        message: Message,
        client: ClientHandle,
    },
    /// `local/data` or `local/disconnect` from a client read loop.
    Local(Message),
    /// A frame received from the gateway.
    Downstream(Message),
    /// A new tunnel connection is up; its writer now belongs to the dispatcher.
    TunnelUp(TunnelWriter),
    /// The tunnel connection with this generation is gone.
    TunnelDown { generation: u64 },
}

pub struct Dispatcher {
    events: mpsc::Receiver<Event>,
    sessions: SessionTable,
    tunnel: Option<TunnelWriter>,
}

impl Dispatcher {
    pub fn new(events: mpsc::Receiver<Event>) -> Self {
        Self {
            events,
            sessions: SessionTable::new(),
            tunnel: None,
        }
    }

    /// Process events until every sender is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
        debug!(sessions = self.sessions.len(), "dispatcher stopped");
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Accepted { message, client } => self.on_local_connect(message, client).await,
            Event::Local(msg) => match msg.kind {
                MessageType::Data => self.on_local_data(msg).await,
                MessageType::Disconnect => self.on_local_disconnect(&msg.session_id).await,
                MessageType::Connect => {
                    warn!(session_id = %msg.session_id, "local connect without a client, dropping");
                }
            },
            Event::Downstream(msg) => match msg.kind {
                MessageType::Data => self.on_downstream_data(msg).await,
                MessageType::Disconnect => self.on_downstream_disconnect(&msg.session_id),
                MessageType::Connect => {
                    warn!(session_id = %msg.session_id, "gateway sent connect, dropping");
                }
            },
            Event::TunnelUp(writer) => {
                info!(generation = writer.generation(), "tunnel writer installed");
                self.tunnel = Some(writer);
            }
            Event::TunnelDown { generation } => self.on_tunnel_down(generation),
        }
    }

    async fn on_local_connect(&mut self, message: Message, client: ClientHandle) {
        let session_id = message.session_id.clone();
        let destination = message.destination.clone().unwrap_or_default();

        // A refused client is dropped here; its read loop then exits without
        // reporting the id closed.
        if let Err(e) = self.sessions.create(&session_id, &destination, client) {
            error!(session_id = %session_id, error = %e, "cannot register session");
            return;
        }

        let upstream = message.with_class(MessageClass::Upstream);
        if !self.send_upstream(&upstream).await {
            // The gateway never learns about this session, so there is
            // nobody to notify when it closes.
            self.abandon(&session_id);
        }
    }

    async fn on_local_data(&mut self, msg: Message) {
        let status = match self.sessions.find(&msg.session_id) {
            Some(session) => session.status,
            None => {
                warn!(session_id = %msg.session_id, length = msg.length(), "data for unknown session, dropping");
                return;
            }
        };
        if status != SessionStatus::Connected {
            debug!(session_id = %msg.session_id, "session closing, dropping client data");
            return;
        }

        self.sessions.touch(&msg.session_id);
        let session_id = msg.session_id.clone();
        let upstream = msg.with_class(MessageClass::Upstream);
        if !self.send_upstream(&upstream).await {
            self.abandon(&session_id);
        }
    }

    async fn on_local_disconnect(&mut self, session_id: &str) {
        let status = match self.sessions.find(session_id) {
            Some(session) => session.status,
            None => {
                debug!(session_id, "disconnect for unknown session");
                return;
            }
        };

        if status == SessionStatus::Connected {
            let upstream = Message::disconnect(MessageClass::Upstream, session_id);
            self.send_upstream(&upstream).await;
        }

        if let Some(mut session) = self.sessions.remove(session_id) {
            let _ = tokio::time::timeout(CLIENT_WRITE_TIMEOUT, session.client.writer.shutdown()).await;
        }
    }

    async fn on_downstream_data(&mut self, msg: Message) {
        let Some(session) = self.sessions.find_mut(&msg.session_id) else {
            warn!(session_id = %msg.session_id, length = msg.length(), "downstream data for unknown session, dropping");
            return;
        };
        if session.status != SessionStatus::Connected {
            debug!(session_id = %msg.session_id, "session closing, dropping downstream data");
            return;
        }

        let write = async {
            session.client.writer.write_all(&msg.payload).await?;
            session.client.writer.flush().await
        };
        match tokio::time::timeout(CLIENT_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                debug!(session_id = %msg.session_id, length = msg.length(), "wrote to client");
                session.last_activity = Instant::now();
            }
            Ok(Err(e)) => {
                warn!(session_id = %msg.session_id, error = %e, "client write failed");
                session.client.request_close();
            }
            Err(_) => {
                warn!(session_id = %msg.session_id, "client write timed out");
                session.client.request_close();
            }
        }
    }

    fn on_downstream_disconnect(&mut self, session_id: &str) {
        if !self.sessions.mark_disconnect_pending(session_id) {
            debug!(session_id, "downstream disconnect for unknown session");
            return;
        }
        info!(session_id, "destination closed, closing client");
        if let Some(session) = self.sessions.find(session_id) {
            session.client.request_close();
        }
    }

    /// Drop the writer for a lost tunnel and close every session it carried.
    fn on_tunnel_down(&mut self, generation: u64) {
        if let Some(writer) = &self.tunnel {
            if writer.generation() > generation {
                debug!(generation, "stale tunnel-down ignored");
                return;
            }
        }
        self.tunnel = None;

        let ids = self.sessions.ids();
        if !ids.is_empty() {
            warn!(generation, count = ids.len(), "tunnel lost, closing all sessions");
        }
        for id in ids {
            self.abandon(&id);
        }
    }

    /// Close a session without telling the gateway.
    fn abandon(&mut self, session_id: &str) {
        self.sessions.mark_disconnect_pending(session_id);
        if let Some(session) = self.sessions.find(session_id) {
            session.client.request_close();
        }
    }

    /// Send one message through the tunnel. Returns `false` if it was lost.
    async fn send_upstream(&mut self, msg: &Message) -> bool {
        let Some(tunnel) = self.tunnel.as_mut() else {
            warn!(session_id = %msg.session_id, kind = %msg.kind, "tunnel not connected, dropping message");
            return false;
        };

        match tunnel.send(msg).await {
            Ok(()) => {
                debug!(session_id = %msg.session_id, kind = %msg.kind, length = msg.length(), "sent upstream");
                true
            }
            Err(e) => {
                error!(session_id = %msg.session_id, error = %e, "tunnel send failed");
                self.tunnel = None;
                false
            }
        }
    }
}
