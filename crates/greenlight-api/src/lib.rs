//! HTTP API for Greenlight.
//!
//! Receives commit webhooks, reports lane state, takes approval decisions
//! and serves the operator outputs of the provisioned stack.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Serve the API on `addr` until the process stops.
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
