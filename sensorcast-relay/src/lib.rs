//! SensorCast relay: MQTT sensor telemetry pushed to live WebSocket viewers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌────────────────────┐    ┌──────────┐    ┌──────────────┐
//! │ MQTT broker │───>│ UpstreamSubscriber │───>│   Hub    │───>│ ViewerSession│ x N
//! │  (1 topic)  │    │  (HistoryBuffer)   │    │ (fan-out)│    │  (WebSocket) │
//! └─────────────┘    └────────────────────┘    └──────────┘    └──────────────┘
//! ```
//!
//! Every viewer receives the bounded recent history as soon as it connects,
//! then the full history again after each new upstream message, as a JSON
//! array of `{"timestamp", "value"}` objects, newest first.
//!
//! # Usage
//!
//! ```bash
//! sensorcast-relay --config relay.json5
//! ```
//!
//! See [`config::RelayConfig`] for configuration options.

pub mod config;
pub mod error;
pub mod history;
pub mod http;
pub mod hub;
pub mod session;
pub mod subscriber;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use history::{HistoryBuffer, Snapshot};
pub use http::ViewerServer;
pub use hub::{Frame, Hub, RelayStats, SessionId, SharedHub};
pub use session::{CloseReason, Registration, SessionState, ViewerSession};
pub use subscriber::UpstreamSubscriber;
