/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::ResolveError;
use crate::notes::NoteEngine;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info_span, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: NoteEngine,
}

pub fn router(engine: NoteEngine) -> Router {
    let max_body = engine.config().http.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/objects/:id", get(get_object))
        .route("/api/v1/statuses/:id", get(get_status))
        .route("/api/v1/statuses/:id/context", get(get_context))
        .route("/inbox", post(inbox))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &http::Request<_>| {
            info_span!("http", method = %req.method(), uri = %req.uri())
        }))
        .with_state(AppState { engine })
}

fn error_response(e: ResolveError) -> Response {
    let status = match &e {
        ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_input() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {e:#}");
    } else {
        warn!("request rejected: {e}");
    }
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response()
}

async fn healthz(State(state): State<AppState>) -> Response {
    let db = state.engine.db().clone();
    match tokio::task::spawn_blocking(move || db.health_check()).await {
        Ok(Ok(())) => (StatusCode::OK, "ok").into_response(),
        Ok(Err(e)) => {
            error!("health check failed: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "db unavailable").into_response()
        }
        Err(e) => {
            error!("health check task failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "db unavailable").into_response()
        }
    }
}

async fn get_object(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let note = match state.engine.from_id(&id, None).await {
        Ok(Some(n)) if !n.is_remote() => n,
        Ok(_) => return not_found(),
        Err(e) => return error_response(e),
    };
    match state.engine.is_viewable_by_user(&note, None).await {
        Ok(true) => {}
        Ok(false) => return not_found(),
        Err(e) => return error_response(e),
    }
    match state.engine.to_lysand(&note).await {
        Ok(wire) => (StatusCode::OK, Json(wire)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let note = match state.engine.from_id(&id, None).await {
        Ok(Some(n)) => n,
        Ok(None) => return not_found(),
        Err(e) => return error_response(e),
    };
    match state.engine.is_viewable_by_user(&note, None).await {
        Ok(true) => {}
        Ok(false) => return not_found(),
        Err(e) => return error_response(e),
    }
    match state.engine.to_api(&note, None).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_context(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let engine = &state.engine;
    let note = match engine.from_id(&id, None).await {
        Ok(Some(n)) => n,
        Ok(None) => return not_found(),
        Err(e) => return error_response(e),
    };
    match engine.is_viewable_by_user(&note, None).await {
        Ok(true) => {}
        Ok(false) => return not_found(),
        Err(e) => return error_response(e),
    }

    let (ancestors, descendants) = match (
        engine.ancestors(&note, None).await,
        engine.descendants(&note, None).await,
    ) {
        (Ok(a), Ok(d)) => (a, d),
        (Err(e), _) | (_, Err(e)) => return error_response(e),
    };

    let mut api_ancestors = Vec::with_capacity(ancestors.len());
    for n in &ancestors {
        match engine.to_api(n, None).await {
            Ok(s) => api_ancestors.push(s),
            Err(e) => return error_response(e),
        }
    }
    let mut api_descendants = Vec::with_capacity(descendants.len());
    for n in &descendants {
        match engine.to_api(n, None).await {
            Ok(s) => api_descendants.push(s),
            Err(e) => return error_response(e),
        }
    }
    (
        StatusCode::OK,
        Json(json!({ "ancestors": api_ancestors, "descendants": api_descendants })),
    )
        .into_response()
}

/// Note deliveries from peers. Signatures are checked upstream.
async fn inbox(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("inbox body is not json: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid json" }))).into_response();
        }
    };
    let note = match state.engine.save_from_remote(None, Some(payload)).await {
        Ok(n) => n,
        Err(e) => return error_response(e),
    };
    match state.engine.to_api(&note, None).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}
