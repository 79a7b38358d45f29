//! HTTP server exposing the viewer WebSocket and status endpoints.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::ViewerConfig;
use crate::error::{RelayError, Result};
use crate::hub::SharedHub;
use crate::session::ViewerSession;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    hub: SharedHub,
    viewer: ViewerConfig,
    shutdown: watch::Receiver<bool>,
}

/// Create the HTTP router.
fn create_router(
    hub: SharedHub,
    viewer: ViewerConfig,
    shutdown: watch::Receiver<bool>,
) -> Router {
    let state = AppState {
        hub,
        viewer,
        shutdown,
    };

    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/history", get(history_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Upgrade to a WebSocket and hand the connection to a viewer session.
async fn ws_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);

    ws.on_upgrade(move |socket| async move {
        let mut session = ViewerSession::new(state.hub, state.viewer, peer);
        session.run(socket, state.shutdown).await;
    })
}

/// Handler for the /history endpoint: the current frame, as viewers see it.
async fn history_handler(State(state): State<AppState>) -> Response {
    match state.hub.snapshot().encode_frame() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode history");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Handler for the /stats endpoint.
async fn stats_handler(State(state): State<AppState>) -> Response {
    Json(state.hub.stats()).into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.hub.stats().upstream_subscribed {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - upstream subscription not established\n",
        )
            .into_response()
    }
}

/// Viewer-facing server bound to its listen address.
pub struct ViewerServer {
    hub: SharedHub,
    viewer: ViewerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ViewerServer {
    /// Bind the listener. Failure here means the relay cannot serve viewers.
    pub async fn bind(
        hub: SharedHub,
        listen_addr: SocketAddr,
        viewer: ViewerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Viewer server listening");

        Ok(Self {
            hub,
            viewer,
            listener,
            local_addr,
        })
    }

    /// Address the server actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let router = create_router(self.hub, self.viewer, shutdown.clone());
        let mut shutdown = shutdown;

        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() {
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("Viewer server shutting down");
        })
        .await?;

        info!("Viewer server stopped");
        Ok(())
    }
}
