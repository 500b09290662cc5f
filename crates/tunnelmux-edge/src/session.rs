//! Session table.
//!
//! Maps a session id to the client-facing writer, the original destination,
//! and the session status. The table is a plain `HashMap` with no locking:
//! it is owned by the event dispatcher task and nothing else may touch it.
//! Any other task that needs a session changed must send an event instead.

use std::collections::HashMap;
use std::time::Instant;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tunnelmux_core::{TunnelError, TunnelResult};

/// Writer half of a client-facing connection.
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What the dispatcher holds for one accepted client.
pub struct ClientHandle {
    /// Write side of the client socket. Only the dispatcher writes to it.
    pub writer: ClientWriter,
    /// Tells the client's read loop to close and report a disconnect.
    pub cancel: mpsc::Sender<()>,
}

impl ClientHandle {
    pub fn new(writer: ClientWriter, cancel: mpsc::Sender<()>) -> Self {
        Self { writer, cancel }
    }

    /// Ask the read loop to stop. Never blocks; a full or closed channel
    /// means the loop is already stopping.
    pub fn request_close(&self) {
        let _ = self.cancel.try_send(());
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    /// The real destination went away; the client is owed a close and the
    /// gateway must not be told about it again.
    DisconnectPending,
    Disconnected,
}

/// One client connection.
pub struct Session {
    pub id: String,
    /// Original destination as `ip:port`.
    pub destination: String,
    pub client: ClientHandle,
    pub status: SessionStatus,
    pub created_at: Instant,
    pub last_activity: Instant,
}

/// Registry of live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `Connected` state.
    ///
    /// Fails if the id is already live; ids are never reused while active.
    pub fn create(
        &mut self,
        session_id: &str,
        destination: &str,
        client: ClientHandle,
    ) -> TunnelResult<()> {
        if self.sessions.contains_key(session_id) {
            return Err(TunnelError::DuplicateSession(session_id.to_string()));
        }

        let now = Instant::now();
        self.sessions.insert(
            session_id.to_string(),
            Session {
                id: session_id.to_string(),
                destination: destination.to_string(),
                client,
                status: SessionStatus::Connected,
                created_at: now,
                last_activity: now,
            },
        );
        info!(session_id, destination, "session created");
        Ok(())
    }

    pub fn find(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn find_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Returns `false` if the session does not exist.
    pub fn mark_disconnect_pending(&mut self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.status = SessionStatus::DisconnectPending;
                debug!(session_id, "session marked disconnect-pending");
                true
            }
            None => false,
        }
    }

    /// Touch a session's activity timestamp.
    pub fn touch(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Remove a session and hand it back for final bookkeeping.
    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let mut session = self.sessions.remove(session_id)?;
        session.status = SessionStatus::Disconnected;
        info!(
            session_id,
            destination = %session.destination,
            lifetime_secs = session.created_at.elapsed().as_secs(),
            "session removed"
        );
        Some(session)
    }

    /// Ids of every live session.
    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
