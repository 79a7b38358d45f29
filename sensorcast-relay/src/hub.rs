//! Broadcast hub that fans history snapshots out to connected viewers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, trace};

use crate::history::Snapshot;

/// Identifier of one viewer session. Never reused.
pub type SessionId = u64;

/// An encoded viewer frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Shared hub handle.
pub type SharedHub = Arc<Hub>;

/// Relay statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    /// Upstream messages received.
    pub messages_received: u64,
    /// Messages appended to the history and broadcast.
    pub messages_accepted: u64,
    /// Messages dropped because the body was not valid text.
    pub messages_dropped: u64,
    /// Frames queued for delivery to viewers.
    pub frames_sent: u64,
    /// Frames dropped because a viewer was not keeping up.
    pub frames_dropped: u64,
    /// Viewers registered since startup.
    pub viewers_total: u64,
    /// Viewers currently registered.
    pub viewers_connected: usize,
    /// Whether the upstream subscription is currently acknowledged.
    pub upstream_subscribed: bool,
}

struct HubState {
    latest: Snapshot,
    /// Encoded `latest`, `None` while the history is empty.
    latest_frame: Option<Frame>,
    sessions: HashMap<SessionId, mpsc::Sender<Frame>>,
}

/// Registry of live viewer sessions.
///
/// The session set and the latest snapshot live behind one lock, so a
/// registration either sees a broadcast's snapshot or takes part in it,
/// never both. No await happens while the lock is held; delivery to a
/// viewer is a non-blocking enqueue onto its bounded queue.
pub struct Hub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    stats: RwLock<RelayStats>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                latest: Snapshot::empty(),
                latest_frame: None,
                sessions: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            stats: RwLock::new(RelayStats::default()),
        }
    }

    /// Add a viewer and send it the current history if there is any.
    pub fn register(&self, sender: mpsc::Sender<Frame>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let mut initial_sent = false;
        if let Some(frame) = &state.latest_frame {
            // A fresh queue always has room for the first frame
            initial_sent = sender.try_send(frame.clone()).is_ok();
        }
        state.sessions.insert(id, sender);
        let connected = state.sessions.len();
        drop(state);

        let mut stats = self.stats.write();
        stats.viewers_total += 1;
        stats.viewers_connected = connected;
        if initial_sent {
            stats.frames_sent += 1;
        }
        drop(stats);

        debug!(session = id, viewers = connected, initial_sent, "Viewer registered");
        id
    }

    /// Remove a viewer. Returns `false` if it was not registered.
    pub fn deregister(&self, id: SessionId) -> bool {
        let mut state = self.state.lock();
        let removed = state.sessions.remove(&id).is_some();
        let connected = state.sessions.len();
        drop(state);

        if removed {
            self.stats.write().viewers_connected = connected;
            debug!(session = id, viewers = connected, "Viewer deregistered");
        } else {
            trace!(session = id, "Deregister of unknown session ignored");
        }
        removed
    }

    /// Push a snapshot to every registered viewer.
    ///
    /// Returns the number of viewers the frame was queued for. Viewers whose
    /// queue is full miss this frame; viewers whose queue is closed are
    /// removed. Neither affects delivery to the others.
    pub fn broadcast(&self, snapshot: Snapshot) -> usize {
        let frame = match snapshot.encode_frame() {
            Ok(json) => Some(Frame::from(json)),
            Err(e) => {
                error!(error = %e, "Failed to encode snapshot, frame not sent");
                None
            }
        };

        let mut sent = 0usize;
        let mut dropped = 0usize;
        let mut closed = Vec::new();

        let has_history = !snapshot.is_empty();

        let mut state = self.state.lock();
        state.latest = snapshot;
        state.latest_frame = frame.clone().filter(|_| has_history);

        if let Some(frame) = &frame {
            for (&id, sender) in &state.sessions {
                match sender.try_send(frame.clone()) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        debug!(session = id, "Viewer queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(id),
                }
            }
        }

        for id in &closed {
            state.sessions.remove(id);
        }
        let connected = state.sessions.len();
        drop(state);

        let mut stats = self.stats.write();
        stats.frames_sent += sent as u64;
        stats.frames_dropped += dropped as u64;
        stats.viewers_connected = connected;
        drop(stats);

        if !closed.is_empty() {
            debug!(removed = ?closed, "Removed closed viewers during broadcast");
        }
        trace!(sent, dropped, viewers = connected, "Broadcast complete");

        sent
    }

    /// The most recently broadcast snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().latest.clone()
    }

    /// Number of registered viewers.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether a session is currently registered.
    pub fn is_registered(&self, id: SessionId) -> bool {
        self.state.lock().sessions.contains_key(&id)
    }

    /// Get relay statistics.
    pub fn stats(&self) -> RelayStats {
        self.stats.read().clone()
    }

    pub(crate) fn record_received(&self) {
        self.stats.write().messages_received += 1;
    }

    pub(crate) fn record_accepted(&self) {
        self.stats.write().messages_accepted += 1;
    }

    pub(crate) fn record_dropped(&self) {
        self.stats.write().messages_dropped += 1;
    }

    pub(crate) fn set_upstream_subscribed(&self, subscribed: bool) {
        self.stats.write().upstream_subscribed = subscribed;
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
