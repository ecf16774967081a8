//! HTTP surface for `hearth-rs`.
//!
//! `hearth-web` exposes the two halves of a suspended turn over HTTP:
//!
//! - `POST /threads/{thread_id}/turns` starts a turn and streams its events
//!   as newline-delimited JSON, with keepalive lines while the turn is quiet
//!   (including while it waits on a question group).
//! - `POST /ask-user/{group_id}/respond` submits the answers that resume it.
//!   `GET /ask-user/{group_id}` returns the pending group.
//!
//! # Quick start
//!
//! ```ignore
//! use hearth_web::{AppState, WebConfig, spawn_web};
//!
//! let state = AppState::new(runner, factory, suspensions.clone());
//! let addr = spawn_web(state, WebConfig::default()).await?;
//! println!("Listening on http://{addr}");
//! ```
//!
//! # Architecture
//!
//! ```text
//! client ──POST /turns──▶ TurnRunner task ──events──▶ keepalive ──NDJSON──▶ client
//!                               │ ask_user
//!                               ▼
//!                        SuspensionStore ◀── POST /ask-user/{id}/respond ── client
//! ```
//!
//! Question groups live in this process. Behind a load balancer, route
//! respond requests to the worker that serves the turn.

mod api;
mod server;

pub use api::{AppState, RespondRequest, Sessions, TurnRequest};
pub use server::{build_router, start_server};

use std::net::SocketAddr;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:3001`.
    pub bind_addr: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(state: AppState, config: WebConfig) -> std::io::Result<SocketAddr> {
    let router = build_router(state);
    start_server(router, config.bind_addr).await
}
