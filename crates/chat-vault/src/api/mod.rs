//! API module - HTTP handlers over the chat database

pub mod admin_api;
pub mod conversation_api;

pub use admin_api::{health, stats};
pub use conversation_api::{
    delete_chat, delete_message, get_chat, get_last_chat, list_chats, rename_chat, save_chat,
    save_context, update_context,
};

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::chat_db::{ChatDatabase, ErrorKind, StoreError, StoreResult};
use crate::metrics;
use crate::shared_state::AppState;

/// Error half of every handler result. Renders as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    BadRequest(String),
    /// Body the JSON extractor refused, with the status it chose
    Rejected(StatusCode, String),
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::Serialization | ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Migration => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(status, _) => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Store(e) => e.to_string(),
            ApiError::BadRequest(msg) | ApiError::Rejected(_, msg) | ApiError::Internal(msg) => msg.clone(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.message());
        }
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

/// Runs a store call on the blocking pool.
pub(crate) async fn with_db<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    F: FnOnce(&ChatDatabase) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || op(db.as_ref()))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// Counts the request under `route` with the status it resolved to.
pub(crate) fn track<T>(route: &str, result: ApiResult<T>) -> ApiResult<T> {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status(),
    };
    metrics::inc_request(route, status);
    result
}
