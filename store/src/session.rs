//! Current-session tracking on top of [`Store`].

use anyhow::{Context, Result, anyhow};
use kiln_types::{Message, SessionId};

use crate::{Session, Store};

pub const DEFAULT_SESSION_TITLE: &str = "New Session";

/// Owns the store and remembers which session the user is in.
///
/// No session exists until [`SessionManager::current`] or
/// [`SessionManager::create`] is called, so launching the app and quitting
/// without typing leaves nothing behind.
pub struct SessionManager {
    store: Store,
    current: Option<SessionId>,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            current: None,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start a new session and make it current.
    pub fn create(&mut self, title: &str) -> Result<Session> {
        let session = self.store.create_session(title)?;
        self.current = Some(session.id.clone());
        Ok(session)
    }

    pub fn switch(&mut self, id: &SessionId) -> Result<Session> {
        let session = self
            .store
            .get_session(id)?
            .ok_or_else(|| anyhow!("Session not found: {id}"))?;
        self.current = Some(session.id.clone());
        Ok(session)
    }

    /// The current session, created on first use.
    pub fn current(&mut self) -> Result<Session> {
        match self.current.clone() {
            Some(id) => self
                .store
                .get_session(&id)?
                .ok_or_else(|| anyhow!("Current session disappeared: {id}")),
            None => self.create(DEFAULT_SESSION_TITLE),
        }
    }

    #[must_use]
    pub fn current_id(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    pub fn list(&self) -> Result<Vec<Session>> {
        self.store.list_sessions()
    }

    /// Deleting the current session leaves no session selected.
    pub fn delete(&mut self, id: &SessionId) -> Result<()> {
        self.store
            .delete_session(id)
            .with_context(|| format!("Failed to delete session {id}"))?;
        if self.current.as_ref() == Some(id) {
            self.current = None;
        }
        Ok(())
    }

    pub fn add_message(&self, message: &Message) -> Result<()> {
        self.store.add_message(message)
    }

    /// Messages of the current session; empty when none is selected.
    pub fn messages(&self) -> Result<Vec<Message>> {
        match &self.current {
            Some(id) => self.store.messages(id),
            None => Ok(Vec::new()),
        }
    }

    pub fn message_count(&self) -> Result<usize> {
        match &self.current {
            Some(id) => self.store.message_count(id),
            None => Ok(0),
        }
    }

    pub fn token_total(&self) -> Result<u64> {
        match &self.current {
            Some(id) => self.store.session_token_total(id),
            None => Ok(0),
        }
    }

    pub fn update_title(&self, title: &str) -> Result<()> {
        let id = self
            .current
            .as_ref()
            .ok_or_else(|| anyhow!("No current session"))?;
        self.store.update_session_title(id, title)
    }
}
