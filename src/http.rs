//! A thin illustrative HTTP boundary (§6.2).
//!
//! The HTTP API surface itself is explicitly out of scope (§1: "treated as
//! a producer that writes to queues and reads from the cache"). This
//! module is not that surface — it's a minimal `axum` router exposing the
//! contract functions of §6.2 directly, included so the core's external
//! interface is exercisable end-to-end without inventing a second, fuller
//! service. A production deployment would replace this with its own
//! richer API layer built on the same library functions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::cache::VConCache;
use crate::config::Config;
use crate::dlq::DlqManager;
use crate::queue::QueueClient;

pub struct AppState {
    pub cache: Arc<VConCache>,
    pub queue: QueueClient,
    pub dlq: DlqManager,
    pub config: Arc<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/vcons/:uuid", get(fetch).delete(delete_vcon))
        .route("/submit", post(submit))
        .route("/external_submit/:queue", post(external_submit))
        .route("/search", get(search))
        .route("/list_by_time", get(list_by_time))
        .route("/dlq/:queue", get(dlq_list))
        .route("/dlq/:queue/reprocess", post(dlq_reprocess))
        .route("/dlq/:queue/:uuid", delete(dlq_purge))
        .with_state(state)
}

#[derive(Deserialize)]
struct SubmitBody {
    uuid: String,
    document: Value,
    ingress_queues: Vec<String>,
}

/// `submit(uuid, document, ingress_queues[])`: write-through the cache and
/// right-push the UUID onto each named queue.
async fn submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Response {
    if let Err(e) = state.cache.put(&body.uuid, &body.document).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    for queue in &body.ingress_queues {
        if let Err(e) = state.queue.push_right(queue, &body.uuid).await {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    StatusCode::ACCEPTED.into_response()
}

#[derive(Deserialize)]
struct ExternalSubmitBody {
    presented_key: String,
    uuid: String,
    document: Value,
}

/// `external_submit(queue, presented_key, uuid, document)`: as `submit`,
/// gated by the ingress authenticator (§4.9).
async fn external_submit(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    Json(body): Json<ExternalSubmitBody>,
) -> Response {
    if !crate::auth::authenticate(&state.config, &queue, &body.presented_key) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if let Err(e) = state.cache.put(&body.uuid, &body.document).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    if let Err(e) = state.queue.push_right(&queue, &body.uuid).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

/// `fetch(uuid) -> document | nil`.
async fn fetch(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Response {
    match state.cache.get(&uuid).await {
        Ok(doc) => Json(doc).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `delete(uuid)`.
async fn delete_vcon(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Response {
    match state.cache.delete(&uuid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct SearchParams {
    tel: Option<String>,
    mailto: Option<String>,
    name: Option<String>,
}

/// `search({tel?, mailto?, name?}) -> uuids[]`.
async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    match state
        .cache
        .search(
            params.tel.as_deref(),
            params.mailto.as_deref(),
            params.name.as_deref(),
        )
        .await
    {
        Ok(uuids) => Json(uuids).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct TimeRangeParams {
    start: i64,
    end: i64,
}

/// `list_by_time(start, end) -> uuids[]`.
async fn list_by_time(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TimeRangeParams>,
) -> Response {
    match state.cache.list_by_time(params.start, params.end).await {
        Ok(uuids) => Json(uuids).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn dlq_list(State(state): State<Arc<AppState>>, Path(queue): Path<String>) -> Response {
    match state.dlq.list(&queue).await {
        Ok(uuids) => Json(uuids).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn dlq_reprocess(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
) -> Response {
    match state.dlq.reprocess(&queue).await {
        Ok(count) => Json(serde_json::json!({"reprocessed": count})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn dlq_purge(
    State(state): State<Arc<AppState>>,
    Path((queue, uuid)): Path<(String, String)>,
) -> Response {
    match state.dlq.purge(&queue, &uuid).await {
        Ok(count) => Json(serde_json::json!({"purged": count})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
