//! Axum server setup and router construction.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::{self, AppState};

/// Build the full axum router.
pub fn build_router(state: AppState) -> Router {
    // Browser clients are usually served from a different origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask-user/{group_id}", get(api::get_question_group))
        .route("/ask-user/{group_id}/respond", post(api::post_responses))
        .route("/threads/{thread_id}/turns", post(api::post_turn))
        .with_state(state)
        .layer(cors)
}

/// Bind `bind_addr`, serve `router` on a background task and return the
/// bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("hearth-web listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Server stopped: {e}");
        }
    });

    Ok(addr)
}
