//! REST and streaming endpoint handlers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use hearth_rs::api::{KeepaliveConfig, StreamEvent, with_keepalive};
use hearth_rs::context::{PolicyTier, Session, SessionFactory};
use hearth_rs::prelude::TurnRunner;
use hearth_rs::suspension::{Responses, SubmitOutcome, SuspensionStore};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Open sessions by thread id.
///
/// A thread keeps the tier it was first opened with; compaction records live
/// on the session, so the same `Session` serves every turn of a thread.
pub struct Sessions {
    factory: SessionFactory,
    open: Mutex<HashMap<String, Arc<Session>>>,
}

impl Sessions {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            factory,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_open(&self, thread_id: &str, tier: &PolicyTier) -> Arc<Session> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = open.get(thread_id) {
            return session.clone();
        }
        debug!(thread = thread_id, ?tier, open = open.len() + 1, "Opening session");
        let session = Arc::new(self.factory.session(thread_id, tier));
        open.insert(thread_id.to_string(), session.clone());
        session
    }
}

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub suspensions: SuspensionStore,
    pub sessions: Arc<Sessions>,
    pub runner: TurnRunner,
    pub keepalive: KeepaliveConfig,
    /// Tier for threads whose first request names none.
    pub tier: PolicyTier,
}

impl AppState {
    pub fn new(runner: TurnRunner, factory: SessionFactory, suspensions: SuspensionStore) -> Self {
        Self {
            suspensions,
            sessions: Arc::new(Sessions::new(factory)),
            runner,
            keepalive: KeepaliveConfig::default(),
            tier: PolicyTier::Standard,
        }
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_tier(mut self, tier: PolicyTier) -> Self {
        self.tier = tier;
        self
    }
}

// ── Suspension ─────────────────────────────────────────────────────

/// Request body for POST /ask-user/{group_id}/respond.
#[derive(Deserialize)]
pub struct RespondRequest {
    pub responses: Responses,
}

/// POST /ask-user/{group_id}/respond: submit answers for a question group.
///
/// 200 when accepted, 404 for an unknown group, 410 when the group was
/// already answered.
pub async fn post_responses(
    State(app): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<RespondRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.suspensions.submit_responses(&group_id, body.responses) {
        SubmitOutcome::Accepted => (StatusCode::OK, Json(json!({"status": "accepted"}))),
        SubmitOutcome::UnknownGroup => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "unknown_group", "group_id": group_id})),
        ),
        SubmitOutcome::AlreadyAnswered => (
            StatusCode::GONE,
            Json(json!({"status": "already_answered", "group_id": group_id})),
        ),
    }
}

/// GET /ask-user/{group_id}: the pending group, or 404 once answered or gone.
pub async fn get_question_group(State(app): State<AppState>, Path(group_id): Path<String>) -> Response {
    match app.suspensions.pending(&group_id) {
        Some(group) => Json(group).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── Turns ──────────────────────────────────────────────────────────

/// Request body for POST /threads/{thread_id}/turns.
#[derive(Deserialize)]
pub struct TurnRequest {
    pub message: String,
    /// Tier for a thread's first turn. Ignored once the thread is open.
    #[serde(default)]
    pub tier: Option<PolicyTier>,
}

/// POST /threads/{thread_id}/turns: run a turn and stream its events.
///
/// The body is `application/x-ndjson`, one [`StreamEvent`] per line, with
/// keepalive lines while the turn is quiet. A failed turn ends with an
/// `error` line.
pub async fn post_turn(
    State(app): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<TurnRequest>,
) -> Response {
    if body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "message must not be empty"})),
        )
            .into_response();
    }

    let tier = body.tier.unwrap_or_else(|| app.tier.clone());
    let session = app.sessions.get_or_open(&thread_id, &tier);
    info!(thread = %thread_id, "Starting turn");

    let events = with_keepalive(app.runner.run(session, body.message), app.keepalive.clone());
    let lines = events.map(|event| {
        let line = match event {
            Ok(event) => event.to_ndjson_line(),
            Err(e) => StreamEvent::Error {
                message: e.to_string(),
            }
            .to_ndjson_line(),
        };
        Ok::<_, Infallible>(line)
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}
