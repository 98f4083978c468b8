//! Registry of live sessions.

use super::Session;
use crate::engine::StorageEngine;
use crate::types::LogicalSessionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps session ids to their [`Session`] objects.
///
/// Sessions are created lazily on first use and never removed; a reaper is
/// outside this crate.
pub struct SessionCatalog {
    engine: Arc<StorageEngine>,
    sessions: RwLock<HashMap<LogicalSessionId, Arc<Session>>>,
}

impl SessionCatalog {
    /// Creates an empty catalog over `engine`.
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Engine the sessions write through.
    #[must_use]
    pub const fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Returns the session, creating it if needed.
    pub fn get_or_create(&self, session_id: LogicalSessionId) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(&session_id) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write();
        Arc::clone(sessions.entry(session_id).or_insert_with(|| {
            debug!(session = %session_id, "created session");
            Arc::new(Session::new(session_id, Arc::clone(&self.engine)))
        }))
    }

    /// Returns the session if it exists.
    #[must_use]
    pub fn get(&self, session_id: &LogicalSessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Invalidates one session's cached view. Returns false if the session
    /// is unknown.
    pub fn invalidate_session(&self, session_id: &LogicalSessionId) -> bool {
        match self.get(session_id) {
            Some(session) => {
                session.invalidate();
                true
            }
            None => false,
        }
    }

    /// Invalidates every session, e.g. after the session table was
    /// rewritten wholesale.
    pub fn invalidate_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in &sessions {
            session.invalidate();
        }
        debug!(sessions = sessions.len(), "invalidated all sessions");
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// True if no session was ever used.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
