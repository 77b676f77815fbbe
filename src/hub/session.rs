//! Observer session lifecycle.
//!
//! ```text
//! Connecting ──register──► Open ──unregister / write error / shutdown──► Closed
//! ```
//!
//! `Closed` has no transitions; a reconnecting client gets a new session id.

use chrono::{DateTime, Utc};
use statum::{machine, state};
use uuid::Uuid;

pub type SessionId = Uuid;

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

#[machine]
#[derive(Debug)]
pub struct ObserverSession<S: SessionState> {
    id: SessionId,
    created_at: DateTime<Utc>,
    /// Remote address, when the transport knows it
    peer: Option<String>,
}

impl<S: SessionState> ObserverSession<S> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }
}

impl ObserverSession<Connecting> {
    /// A freshly accepted connection that has not seen its `init` frame yet.
    pub fn accept(peer: Option<String>) -> Self {
        Self::new(Uuid::new_v4(), Utc::now(), peer)
    }

    pub(super) fn open(self) -> ObserverSession<Open> {
        self.transition()
    }
}

impl ObserverSession<Open> {
    pub(super) fn close(self) -> ObserverSession<Closed> {
        self.transition()
    }
}

impl ObserverSession<Closed> {
    /// How long the session was alive.
    pub fn lifetime(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
