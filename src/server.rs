//! Application state, HTTP router, and the REST directory surface.
//!
//! The relay core lives behind `GET /ws`; the remaining routes are the thin
//! CRUD surface around it: account signup/login, directory search (which
//! reads the live online flag from the presence registry), and message
//! history.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::STATUS_CHANNEL_CAPACITY;
use crate::delivery::{DeliveryEngine, SharedStorage};
use crate::presence::PresenceRegistry;
use crate::session;
use crate::storage::{Storage, StorageError, UserRow};

#[derive(Clone)]
pub struct AppState {
    pub storage: SharedStorage,
    pub registry: Arc<PresenceRegistry>,
    pub delivery: Arc<DeliveryEngine>,
}

impl AppState {
    pub fn new(storage: Storage) -> Self {
        let storage: SharedStorage = Arc::new(Mutex::new(storage));
        let registry = Arc::new(PresenceRegistry::new(STATUS_CHANNEL_CAPACITY));
        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
        ));
        Self {
            storage,
            registry,
            delivery,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/ws", get(ws_handler))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/search", get(search))
        .route("/messages/:identity", get(message_history))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| session::run_session(socket, state))
        .into_response()
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "success": false, "message": message.into() });
    (status, Json(body)).into_response()
}

// -- Accounts --

#[derive(Deserialize)]
struct SignupRequest {
    identity: String,
    phone: String,
    display_name: Option<String>,
}

async fn signup(State(state): State<AppState>, Json(req): Json<SignupRequest>) -> Response {
    if req.identity.is_empty() || req.phone.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "identity and phone required");
    }

    // Default the display name to the identity's local part
    let display_name = req.display_name.filter(|name| !name.is_empty()).or_else(|| {
        req.identity
            .split('@')
            .next()
            .map(|local| local.to_string())
    });

    let row = UserRow {
        identity: req.identity,
        phone: req.phone,
        display_name,
    };

    let result = {
        let storage = state.storage.lock().await;
        storage.insert_user(&row)
    };
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true })),
        )
            .into_response(),
        Err(StorageError::AlreadyExists(_)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": false,
                "message": "identity already registered",
            })),
        )
            .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    identity: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let result = {
        let storage = state.storage.lock().await;
        storage.get_user(&req.identity)
    };
    match result {
        Ok(Some(user)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "phone": user.phone })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": false, "message": "user not found" })),
        )
            .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// -- Directory search --

#[derive(Deserialize)]
struct SearchQuery {
    key: String,
}

async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> Response {
    let result = {
        let storage = state.storage.lock().await;
        storage.find_user_by_key(&query.key)
    };
    match result {
        Ok(Some(user)) => {
            let online = state.registry.is_online(&user.identity);
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "found": true,
                    "identity": user.identity,
                    "phone": user.phone,
                    "display_name": user.display_name,
                    "online": online,
                })),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::OK,
            Json(serde_json::json!({ "found": false })),
        )
            .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// -- Message history --

async fn message_history(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Response {
    let result = {
        let storage = state.storage.lock().await;
        storage.history_for(&identity)
    };
    match result {
        Ok(messages) => {
            let json: Vec<serde_json::Value> = messages
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "from": m.sender,
                        "to": m.recipient,
                        "text": m.body,
                        "timestamp": m.timestamp,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!(json))).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
