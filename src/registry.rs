//! Server-side session registry and id allocation.
//!
//! The registry maps session ids to live sessions so that a resuming
//! carrier can be handed to the session it belongs to. A session is
//! inserted at admission and removed only by its terminal cleanup, after
//! both worker loops have exited.
//!
//! The id allocator deliberately has its own lock so allocation never
//! contends with registry lookups, and the live-connection counter is a
//! bare atomic read by logging alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::frame::SessionId;
use crate::session::Session;

/// Mapping from session id to session, plus the id allocator and the
/// connection counter.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: Mutex<SessionId>,
    connections: AtomicI64,
}

impl Registry {
    /// Create an empty registry; ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session id. Monotonically increasing from 1.
    pub async fn allocate_id(&self) -> SessionId {
        let mut next = self.next_id.lock().await;
        *next += 1;
        *next
    }

    /// Insert a session under its id.
    pub async fn insert(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id(), session);
    }

    /// Look up a session for a resume.
    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).cloned()
    }

    /// Remove a session at terminal cleanup.
    pub async fn remove(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id);
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Note an admitted connection; returns the new live count.
    pub fn connection_opened(&self) -> i64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Note a finished connection; returns the new live count.
    pub fn connection_closed(&self) -> i64 {
        self.connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Current live connection count, for logs and tests.
    #[must_use]
    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }
}
