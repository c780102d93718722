//! HTTP surface of a [`CoordinationService`], shared by the hosting router and
//! [`super::HttpCoordinator`].

use super::{CoordinationService, KeyValue, LeaseId};
use crate::error::CoordError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// First frame of every watch stream, sent once the watch is registered.
pub const WATCH_READY: &str = "ready";

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantRequest {
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub lease: LeaseId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub lease: LeaseId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrefixRequest {
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub kv: Option<KeyValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Whether a key was created (put/create) or removed (delete).
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Set when the failure is an expired lease.
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    pub key: String,
}

type SharedCoordinator = Arc<dyn CoordinationService>;
type Rejection = (StatusCode, Json<ErrorResponse>);

fn reject(err: CoordError) -> Rejection {
    let (status, lease) = match &err {
        CoordError::LeaseExpired(lease) => (StatusCode::NOT_FOUND, Some(*lease)),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            lease,
        }),
    )
}

/// Routes relative to the mount point (the lobby mounts them under `/v1`).
pub fn router(coordinator: SharedCoordinator) -> Router {
    Router::new()
        .route("/lease/grant", post(grant_lease))
        .route("/lease/refresh", post(refresh_lease))
        .route("/lease/revoke", post(revoke_lease))
        .route("/kv/get", post(get_key))
        .route("/kv/range", post(get_prefix))
        .route("/kv/put", post(put_key))
        .route("/kv/create", post(create_key))
        .route("/kv/delete", post(delete_key))
        .route("/watch", get(watch_key))
        .with_state(coordinator)
}

async fn grant_lease(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<GrantRequest>,
) -> Result<Json<LeaseResponse>, Rejection> {
    let lease = coord
        .grant_lease(Duration::from_millis(request.ttl_ms))
        .await
        .map_err(reject)?;
    debug!("Granted lease {} for {}ms", lease, request.ttl_ms);
    Ok(Json(LeaseResponse { lease }))
}

async fn refresh_lease(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<LeaseRequest>,
) -> Result<Json<LeaseResponse>, Rejection> {
    coord.refresh_lease(request.lease).await.map_err(reject)?;
    Ok(Json(LeaseResponse { lease: request.lease }))
}

async fn revoke_lease(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<LeaseRequest>,
) -> Result<Json<LeaseResponse>, Rejection> {
    coord.revoke_lease(request.lease).await.map_err(reject)?;
    Ok(Json(LeaseResponse { lease: request.lease }))
}

async fn get_key(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<KeyRequest>,
) -> Result<Json<GetResponse>, Rejection> {
    let kv = coord.get(&request.key).await.map_err(reject)?;
    Ok(Json(GetResponse { kv }))
}

async fn get_prefix(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<PrefixRequest>,
) -> Result<Json<RangeResponse>, Rejection> {
    let kvs = coord.get_prefix(&request.prefix).await.map_err(reject)?;
    Ok(Json(RangeResponse { kvs }))
}

async fn put_key(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<PutRequest>,
) -> Result<Json<WriteResponse>, Rejection> {
    coord
        .put(&request.key, &request.value, request.lease)
        .await
        .map_err(reject)?;
    Ok(Json(WriteResponse { changed: true }))
}

async fn create_key(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<PutRequest>,
) -> Result<Json<WriteResponse>, Rejection> {
    let changed = coord
        .put_if_absent(&request.key, &request.value, request.lease)
        .await
        .map_err(reject)?;
    Ok(Json(WriteResponse { changed }))
}

async fn delete_key(
    State(coord): State<SharedCoordinator>,
    Json(request): Json<KeyRequest>,
) -> Result<Json<WriteResponse>, Rejection> {
    let changed = coord.delete(&request.key).await.map_err(reject)?;
    Ok(Json(WriteResponse { changed }))
}

async fn watch_key(
    ws: WebSocketUpgrade,
    Query(query): Query<WatchQuery>,
    State(coord): State<SharedCoordinator>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_watch(socket, coord, query.key))
}

async fn stream_watch(mut socket: WebSocket, coord: SharedCoordinator, key: String) {
    let mut watcher = match coord.watch(&key).await {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("Watch on {} failed: {}", key, e);
            return;
        }
    };
    if socket.send(Message::Text(WATCH_READY.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = watcher.next() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode watch event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Watch on {} ended", key);
}
