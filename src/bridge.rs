//! Inbound pipeline
//!
//! The one task that consumes [`TransportEvent`]s. Each message is routed, merged and
//! fanned out before the next event is read, which is what keeps revisions and
//! frame order in step:
//!
//! ```text
//! TransportEvent ──► RouteTable ──► MergeEngine ──► StateStore ──► FanoutHub
//!  (mpsc, ordered)   (category)     (revision+1)    (swap Arc)     (enqueue only)
//! ```
//!
//! Connectivity events only touch the `online` flag and never produce frames.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::hub::FanoutHub;
use crate::mqtt::{MQTTMessage, TransportEvent};
use crate::routing::RouteTable;
use crate::state::{MergeEngine, MergeOutcome, OnlinePolicy, StateStore};

/// Counters reported when the inbound loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub accepted: u64,
    pub dropped: u64,
    pub unrouted: u64,
}

pub struct InboundLoop {
    events: mpsc::Receiver<TransportEvent>,
    engine: MergeEngine,
    store: Arc<StateStore>,
    hub: Arc<FanoutHub>,
    routes: Arc<RouteTable>,
    stats: BridgeStats,
}

impl InboundLoop {
    pub fn new(
        events: mpsc::Receiver<TransportEvent>,
        engine: MergeEngine,
        store: Arc<StateStore>,
        hub: Arc<FanoutHub>,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            events,
            engine,
            store,
            hub,
            routes,
            stats: BridgeStats::default(),
        }
    }

    /// Runs the loop on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<BridgeStats> {
        tokio::spawn(self.run(cancel))
    }

    /// Processes events until cancelled or until the transport side hangs up.
    pub async fn run(mut self, cancel: CancellationToken) -> BridgeStats {
        info!(policy = ?self.engine.policy(), "Inbound loop started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event),
                None => {
                    debug!("Transport event channel closed");
                    break;
                }
            }
        }
        info!(
            accepted = self.stats.accepted,
            dropped = self.stats.dropped,
            unrouted = self.stats.unrouted,
            "Inbound loop stopped"
        );
        self.stats
    }

    fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.engine.policy() == OnlinePolicy::OnConnect {
                    self.store.set_online(true);
                }
            }
            TransportEvent::Disconnected => self.store.set_online(false),
            TransportEvent::Message(message) => self.handle_message(message),
            TransportEvent::Error(cause) => debug!(error = %cause, "Transport reported error"),
        }
    }

    fn handle_message(&mut self, message: MQTTMessage) {
        trace!(message = %message, "Processing inbound message");
        let Some(category) = self.routes.category_for(&message.topic) else {
            warn!(topic = %message.topic, "No route for inbound topic, dropping");
            self.stats.unrouted += 1;
            return;
        };

        match self.engine.apply_payload(category, &message.payload) {
            MergeOutcome::Accepted(snapshot) => {
                self.stats.accepted += 1;
                self.hub.on_snapshot_changed(&snapshot);
            }
            MergeOutcome::Dropped(_) => self.stats.dropped += 1,
        }
    }
}
