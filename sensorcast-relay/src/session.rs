//! Viewer session lifecycle.
//!
//! A session is push-only: frames queued by the hub are written to the
//! WebSocket, and anything the viewer sends is ignored apart from the
//! close handshake.

use std::fmt;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::config::ViewerConfig;
use crate::hub::{Frame, SessionId, SharedHub};

/// Lifecycle state of a viewer session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The viewer closed the connection.
    ClosedByViewer,
    /// Reading from the connection failed.
    Transport(String),
    /// Writing a frame failed.
    SendFailed(String),
    /// Writing a frame took longer than the send timeout.
    SendTimeout,
    /// The hub dropped the session's queue.
    Dropped,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClosedByViewer => write!(f, "closed by viewer"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::SendFailed(e) => write!(f, "send failed: {}", e),
            CloseReason::SendTimeout => write!(f, "send timed out"),
            CloseReason::Dropped => write!(f, "dropped by hub"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Keeps a session registered with the hub for as long as it is alive.
///
/// Dropping it deregisters the session, so every exit path (including
/// unwinding) removes the viewer exactly once.
pub struct Registration {
    hub: SharedHub,
    id: SessionId,
}

impl Registration {
    /// Register a new session; the hub sends the current history right away.
    pub fn register(hub: SharedHub, sender: mpsc::Sender<Frame>) -> Self {
        let id = hub.register(sender);
        Self { hub, id }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

/// One connected viewer.
pub struct ViewerSession {
    hub: SharedHub,
    config: ViewerConfig,
    peer: Option<SocketAddr>,
    state: SessionState,
}

impl ViewerSession {
    pub fn new(hub: SharedHub, config: ViewerConfig, peer: Option<SocketAddr>) -> Self {
        Self {
            hub,
            config,
            peer,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the viewer until either side closes the connection.
    ///
    /// Leaves the session in the `Closed` state.
    pub async fn run(
        &mut self,
        mut socket: WebSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloseReason {
        let (sender, mut frames) = mpsc::channel(self.config.queue_capacity);
        let registration = Registration::register(self.hub.clone(), sender);
        let id = registration.id();
        self.state = SessionState::Registered;

        info!(session = id, peer = ?self.peer, "Viewer connected");

        let send_timeout = self.config.send_timeout();

        let reason = loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break CloseReason::Dropped;
                    };
                    let send = socket.send(Message::Text(frame.to_string()));
                    match tokio::time::timeout(send_timeout, send).await {
                        Ok(Ok(())) => trace!(session = id, bytes = frame.len(), "Frame sent"),
                        Ok(Err(e)) => break CloseReason::SendFailed(e.to_string()),
                        Err(_) => break CloseReason::SendTimeout,
                    }
                }
                message = socket.recv() => {
                    match message {
                        None | Some(Ok(Message::Close(_))) => break CloseReason::ClosedByViewer,
                        Some(Ok(_)) => trace!(session = id, "Ignoring viewer message"),
                        Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let close = socket.send(Message::Close(None));
                        match tokio::time::timeout(send_timeout, close).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(session = id, error = %e, "Failed to send close frame")
                            }
                            Err(_) => debug!(session = id, "Timed out sending close frame"),
                        }
                        break CloseReason::Shutdown;
                    }
                }
            }
        };

        drop(registration);
        self.state = SessionState::Closed;

        match &reason {
            CloseReason::ClosedByViewer | CloseReason::Shutdown => {
                info!(session = id, peer = ?self.peer, reason = %reason, "Viewer disconnected");
            }
            _ => {
                info!(session = id, peer = ?self.peer, reason = %reason, "Viewer session ended");
                debug!(session = id, state = ?self.state, "Session closed after error");
            }
        }

        reason
    }
}
