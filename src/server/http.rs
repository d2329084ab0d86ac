//! Room lifecycle HTTP endpoints
//!
//! Thin wrappers over the room registry: create a room, check a code, and a
//! health probe.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::hub::{Hub, RoomId};

/// Longest room code accepted by the API
const MAX_CODE_LENGTH: usize = 16;

/// Errors surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid room code: {0:?}")]
    InvalidRoomCode(String),
}

/// Result type for HTTP handlers
pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidRoomCode(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Response to a room creation
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CreatedRoom {
    pub room_id: RoomId,
}

/// Response to a room lookup
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub exists: bool,
    pub user_count: usize,
}

/// Health probe body
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub status: String,
    pub rooms: usize,
    pub participants: usize,
}

/// `POST /rooms`
pub async fn create_room(State(hub): State<Arc<Hub>>) -> (StatusCode, Json<CreatedRoom>) {
    let room_id = hub.rooms().create_room().await;
    info!("Created room {}", room_id);
    (StatusCode::CREATED, Json(CreatedRoom { room_id }))
}

/// `GET /rooms/{code}`
pub async fn validate_room(
    State(hub): State<Arc<Hub>>,
    Path(code): Path<String>,
) -> ApiResult<Json<RoomStatus>> {
    let room_id = RoomId::parse(&code);
    let well_formed = !room_id.as_str().is_empty()
        && room_id.as_str().len() <= MAX_CODE_LENGTH
        && room_id.as_str().chars().all(|c| c.is_ascii_alphanumeric());
    if !well_formed {
        return Err(ApiError::InvalidRoomCode(code));
    }

    let user_count = if room_id.is_lobby() {
        None
    } else {
        hub.rooms().member_count(&room_id).await
    };
    Ok(Json(RoomStatus {
        room_id,
        exists: user_count.is_some(),
        user_count: user_count.unwrap_or(0),
    }))
}

/// `GET /health`
pub async fn health(State(hub): State<Arc<Hub>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        rooms: hub.rooms().room_count().await,
        participants: hub.participants().count().await,
    })
}
