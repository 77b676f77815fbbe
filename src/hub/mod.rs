//! # Fan-out Hub
//!
//! Keeps the set of live observer sessions and pushes every snapshot change to each
//! of them.
//!
//! ## Why This Module Exists
//!
//! Observers are browsers on the other side of a websocket. Some of them are slow,
//! some vanish without a close frame, and new ones show up while updates are
//! flowing. The hub gives each session its own bounded outbox so that one stalled
//! socket cannot hold back the others, and it hands a new session the current
//! snapshot as an `init` frame before any `update` frame can reach it.
//!
//! ## Frames
//!
//! ```text
//! {"type": "init",   "data": <snapshot>}   first frame of every session
//! {"type": "update", "data": <snapshot>}   one per accepted merge, in revision order
//! ```
//!
//! A snapshot is serialized once per change. The resulting [`Frame`] is a
//! reference-counted websocket text payload, so every outbox and every socket write
//! shares the same bytes.
//!
//! ## Concurrency
//!
//! Registration and broadcast take the same registry lock. A session registered
//! while a broadcast runs either sees that broadcast (its `init` was older) or has
//! it skipped (its `init` already carried that revision), never both and never a
//! lower revision after a higher one.

pub mod session;

use axum::extract::ws::Utf8Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::state::{Snapshot, StateStore};
pub use session::{ObserverSession, SessionId, SessionState};
use session::{Connecting, Open};

/// Serialized outbound frame, shared between sessions.
pub type Frame = Utf8Bytes;

pub const DEFAULT_SESSION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Init,
    Update,
}

#[derive(Serialize)]
struct FrameBody<'a> {
    #[serde(rename = "type")]
    kind: FrameKind,
    data: &'a Snapshot,
}

pub fn encode_frame(kind: FrameKind, snapshot: &Snapshot) -> Result<Frame, serde_json::Error> {
    let text = serde_json::to_string(&FrameBody {
        kind,
        data: snapshot,
    })?;
    Ok(Frame::from(text))
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub skipped: usize,
    pub evicted: usize,
}

/// Receiving end of a registered session's outbox.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    frames: mpsc::Receiver<Frame>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next frame, or `None` once the hub has dropped the session.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: ObserverSession<Open>,
    outbox: mpsc::Sender<Frame>,
    last_revision: u64,
}

#[derive(Debug)]
pub struct FanoutHub {
    store: Arc<StateStore>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    buffer: usize,
}

impl FanoutHub {
    /// `buffer` is the per-session outbox depth; a session that falls this far
    /// behind is dropped.
    pub fn new(store: Arc<StateStore>, buffer: usize) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the session and queues its `init` frame ahead of any update.
    pub fn register(&self, session: ObserverSession<Connecting>) -> Result<SessionHandle, HubError> {
        let mut sessions = self.registry();

        let snapshot = self.store.current();
        let init = encode_frame(FrameKind::Init, &snapshot)?;

        let (outbox, frames) = mpsc::channel(self.buffer);
        // Fresh channel with capacity >= 1, cannot be full.
        let _ = outbox.try_send(init);

        let session = session.open();
        let id = session.id();
        info!(
            session = %id,
            peer = session.peer().unwrap_or("unknown"),
            revision = snapshot.revision,
            "Observer session opened"
        );
        sessions.insert(
            id,
            SessionEntry {
                session,
                outbox,
                last_revision: snapshot.revision,
            },
        );

        Ok(SessionHandle { id, frames })
    }

    /// Removes the session if it is still registered. Safe to call more than once.
    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self.registry().remove(&id);
        match removed {
            Some(entry) => {
                let closed = entry.session.close();
                info!(
                    session = %id,
                    lifetime_ms = closed.lifetime().num_milliseconds(),
                    "Observer session closed"
                );
                true
            }
            None => false,
        }
    }

    /// Queues an `update` frame for every open session.
    ///
    /// Never blocks on a session: a full or closed outbox evicts that session and
    /// the rest still get the frame. Sessions that already hold this revision are
    /// skipped.
    pub fn on_snapshot_changed(&self, snapshot: &Snapshot) -> FanoutReport {
        let frame = match encode_frame(FrameKind::Update, snapshot) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(revision = snapshot.revision, error = %e, "Could not encode update frame");
                return FanoutReport::default();
            }
        };

        let mut report = FanoutReport::default();
        let mut evicted = Vec::new();
        let mut sessions = self.registry();

        for (id, entry) in sessions.iter_mut() {
            if entry.last_revision >= snapshot.revision {
                report.skipped += 1;
                continue;
            }
            match entry.outbox.try_send(frame.clone()) {
                Ok(()) => {
                    entry.last_revision = snapshot.revision;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(session = %id, "Observer outbox full, dropping session");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = %id, "Observer outbox closed, dropping session");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            if let Some(entry) = sessions.remove(&id) {
                entry.session.close();
                report.evicted += 1;
            }
        }

        debug!(
            revision = snapshot.revision,
            delivered = report.delivered,
            skipped = report.skipped,
            evicted = report.evicted,
            "Fan-out complete"
        );
        report
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.registry().contains_key(&id)
    }

    /// Drops every session; their receivers drain and then end.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.registry().drain().collect();
        for (id, entry) in drained {
            entry.session.close();
            debug!(session = %id, "Observer session closed on shutdown");
        }
    }
}
