//! HTTP and WebSocket routes of the reference sync server.
//!
//! - `GET /health`: health check (no auth)
//! - `POST /sync/upload`, `GET /sync/download`: delta sync
//! - `POST /sync/push`, `GET /sync/pull`: legacy whole-payload sync
//! - `GET /ws?userId=&deviceId=`: real-time relay, authenticated in-band

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{auth_middleware, ApiKey, ApiKeyStore};
use super::hub::{Origin, RealtimeHub};
use super::store::{RemoteStore, RemoteStoreError};
use crate::transport::protocol::{
    DownloadQuery, DownloadResponse, HealthResponse, PullQuery, PullResponse, PushRequest,
    PushResponse, RealtimeMessage, UploadRequest, UploadResponse,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RemoteStore>,
    pub hub: Arc<RealtimeHub>,
    pub api_keys: Arc<ApiKeyStore>,
}

impl AppState {
    pub fn new(store: RemoteStore, api_keys: ApiKeyStore) -> Self {
        Self {
            store: Arc::new(store),
            hub: Arc::new(RealtimeHub::new()),
            api_keys: Arc::new(api_keys),
        }
    }
}

/// Error response body for non-2xx replies
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

enum ApiError {
    Forbidden,
    BadRequest(String),
    Internal(String),
}

impl From<RemoteStoreError> for ApiError {
    fn from(e: RemoteStoreError) -> Self {
        match e {
            RemoteStoreError::InvalidUserId(_) => ApiError::BadRequest(e.to_string()),
            RemoteStoreError::Storage(_) => {
                error!("Remote store failure: {}", e);
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "API key is not valid for this user".to_string(),
            ),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

fn authorize(key: &ApiKey, user_id: &str) -> Result<(), ApiError> {
    if key.permits(user_id) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn upload(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    authorize(&key, &request.user_id)?;
    let outcome =
        state
            .store
            .apply_upload(&request.user_id, &request.data, request.last_sync_timestamp)?;

    if outcome.accepted > 0 {
        let bare = RealtimeMessage::SyncUpdate {
            entity_type: None,
            action: None,
            entity: serde_json::Value::Null,
        };
        let origin = match request.device_id {
            Some(device) => Origin::Device(device),
            None => Origin::Server,
        };
        let delivered = state.hub.broadcast(&request.user_id, origin, bare).await;
        debug!(user_id = %request.user_id, delivered, "Announced upload");
    }

    Ok(Json(UploadResponse {
        success: true,
        errors: outcome.errors,
    }))
}

async fn download(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadResponse>, ApiError> {
    authorize(&key, &query.user_id)?;
    let data = state.store.download(&query.user_id, query.last_sync)?;
    Ok(Json(DownloadResponse {
        data,
        errors: Vec::new(),
    }))
}

async fn push(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    authorize(&key, &request.user_id)?;
    state
        .store
        .push_payload(&request.user_id, request.payload)?;
    Ok(Json(PushResponse {
        ok: true,
        message: "Data pushed successfully".to_string(),
        user_id: request.user_id,
    }))
}

async fn pull(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, ApiError> {
    authorize(&key, &query.user_id)?;
    let payload = state.store.pull_payload(&query.user_id)?;
    Ok(Json(PullResponse {
        ok: true,
        user_id: query.user_id,
        payload,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    user_id: String,
    #[serde(default)]
    device_id: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.user_id.is_empty() {
        return ApiError::BadRequest("userId is required".to_string()).into_response();
    }
    ws.on_upgrade(move |socket| relay(socket, state, query.user_id, query.device_id))
}

/// Relays one connection. Until it authenticates (when keys are
/// configured) nothing is forwarded and any other message closes it.
async fn relay(socket: WebSocket, state: AppState, user_id: String, device_id: Option<String>) {
    let connection = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut authenticated = state.api_keys.is_open();
    let mut updates = state.hub.subscribe(&user_id).await;
    info!(user_id = %user_id, %connection, "Real-time client connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) if authenticated && update.is_for(connection, device_id.as_deref()) => {
                    let Ok(text) = update.message.encode() else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(user_id = %user_id, skipped, "Relay lagged, asking client to resync");
                    if authenticated {
                        let resync = r#"{"type":"sync_update","entity":null}"#;
                        if sender.send(Message::Text(resync.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let message = match RealtimeMessage::decode(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("Ignoring undecodable message: {}", e);
                            continue;
                        }
                    };
                    match message {
                        RealtimeMessage::Auth { api_key } => {
                            match state.api_keys.validate(&api_key) {
                                Some(key) if key.permits(&user_id) => authenticated = true,
                                _ => {
                                    warn!(user_id = %user_id, "Real-time auth failed");
                                    break;
                                }
                            }
                        }
                        _ if !authenticated => {
                            warn!(user_id = %user_id, "Message before auth, closing");
                            break;
                        }
                        RealtimeMessage::SyncNotify { entity_type, action, entity, user_id: from } => {
                            if from != user_id {
                                warn!(user_id = %user_id, from = %from, "Notify for another user ignored");
                                continue;
                            }
                            let update = RealtimeMessage::update_for(entity_type, action, entity);
                            let origin = Origin::Connection(connection);
                            state.hub.broadcast(&user_id, origin, update).await;
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    drop(updates);
    state.hub.prune().await;
    info!(user_id = %user_id, %connection, "Real-time client disconnected");
}

/// Builds the full application router.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth). The relay authenticates in-band because
    // browsers cannot set headers on WebSocket upgrades.
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler));

    let protected_routes = Router::new()
        .route("/sync/upload", post(upload))
        .route("/sync/download", get(download))
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
