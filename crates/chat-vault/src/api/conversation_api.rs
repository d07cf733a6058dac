//! API endpoints for conversation management

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{track, with_db, ApiError, ApiResult};
use crate::chat_db::{
    recognized_fields, ContextField, ContextPatch, Conversation, ConversationSummary, Outcome,
    SaveConversation,
};
use crate::shared_state::AppState;

/// Acknowledgement returned by the mutating endpoints
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub status: Outcome,
}

#[derive(Debug, Serialize)]
pub struct RenameResponse {
    pub id: String,
    pub title: String,
    pub status: Outcome,
}

#[derive(Debug, Serialize)]
pub struct SaveContextResponse {
    pub id: String,
    pub status: &'static str,
    pub updated_fields: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    pub title: Option<String>,
}

/// GET /api/chats
pub async fn list_chats(State(state): State<AppState>) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let result = with_db(&state, |db| db.conversations.list()).await;
    if let Ok(chats) = &result {
        info!("Found {} conversations", chats.len());
    }
    track("list_chats", result.map(Json))
}

/// GET /api/chats/last
pub async fn get_last_chat(State(state): State<AppState>) -> ApiResult<Json<Conversation>> {
    let result = with_db(&state, |db| db.conversations.get_most_recent()).await;
    track("get_last_chat", result.map(Json))
}

/// GET /api/chats/:id
pub async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let result = with_db(&state, move |db| db.conversations.get(&id)).await;
    track("get_chat", result.map(Json))
}

/// POST /api/chats
pub async fn save_chat(
    State(state): State<AppState>,
    payload: Result<Json<SaveConversation>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let result = async {
        let Json(save) = payload?;
        let (conversation, outcome) =
            with_db(&state, move |db| db.conversations.create_or_update(save)).await?;
        Ok::<_, ApiError>(Json(StatusResponse {
            id: conversation.id,
            status: outcome,
        }))
    }
    .await;
    track("save_chat", result)
}

/// PUT /api/chats/:id/context
///
/// Clients send their whole context object; keys that are not context slots
/// are dropped whatever their type, and `null` clears a slot.
pub async fn update_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let result = async {
        let Json(body) = payload?;
        let patch = context_patch(body, NullField::Clear)?;
        let outcome = with_db(&state, {
            let id = id.clone();
            move |db| db.conversations.update_context_fields(&id, &patch)
        })
        .await?;
        Ok::<_, ApiError>(Json(StatusResponse { id, status: outcome }))
    }
    .await;
    track("update_context", result)
}

/// POST /save-context
///
/// Single-tab save used by the web client: `chatId` travels in the body next
/// to the context keys, and keys sent as `null` are skipped rather than
/// cleared.
pub async fn save_context(
    State(state): State<AppState>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<Json<SaveContextResponse>> {
    let result = async {
        let Json(mut body) = payload?;
        let chat_id = match body.remove("chatId") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(ApiError::BadRequest("chatId is required".to_string())),
        };
        let patch = context_patch(body, NullField::Skip)?;
        debug!("Saving context for chat {}: {:?}", chat_id, patch.keys().collect::<Vec<_>>());

        let updated_fields: Vec<&'static str> = recognized_fields(&patch)
            .into_iter()
            .map(|(field, _)| field.key())
            .collect();

        with_db(&state, {
            let chat_id = chat_id.clone();
            move |db| db.conversations.update_context_fields(&chat_id, &patch)
        })
        .await?;

        Ok::<_, ApiError>(Json(SaveContextResponse {
            id: chat_id,
            status: "context_saved",
            updated_fields,
        }))
    }
    .await;
    track("save_context", result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullField {
    Clear,
    Skip,
}

/// Turns a client context object into a patch of recognized slots.
/// Numbers and booleans are stored as their text, as the TEXT columns
/// always held them.
fn context_patch(body: Map<String, Value>, nulls: NullField) -> ApiResult<ContextPatch> {
    let mut patch = ContextPatch::new();
    let mut ignored = Vec::new();

    for (key, value) in body {
        if ContextField::from_key(&key).is_none() {
            ignored.push(key);
            continue;
        }
        let text = match value {
            Value::Null if nulls == NullField::Skip => continue,
            Value::Null => None,
            Value::String(text) => Some(text),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => {
                return Err(ApiError::BadRequest(format!(
                    "context field '{}' must be text, got {}",
                    key, other
                )))
            }
        };
        patch.insert(key, text);
    }

    if !ignored.is_empty() {
        debug!("Ignoring non-context keys: {}", ignored.join(", "));
    }
    if patch.is_empty() {
        let msg = if ignored.is_empty() {
            "no context fields supplied".to_string()
        } else {
            format!("no recognized context field among: {}", ignored.join(", "))
        };
        return Err(ApiError::BadRequest(msg));
    }
    Ok(patch)
}

/// PUT /api/chats/:id/rename
pub async fn rename_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> ApiResult<Json<RenameResponse>> {
    let result = async {
        let Json(req) = payload?;
        let title = req
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("\"title\" is required".to_string()))?;

        let outcome = with_db(&state, {
            let (id, title) = (id.clone(), title.clone());
            move |db| db.conversations.rename(&id, &title)
        })
        .await?;

        Ok::<_, ApiError>(Json(RenameResponse { id, title, status: outcome }))
    }
    .await;
    track("rename_chat", result)
}

/// DELETE /api/chats/:id/messages/:message_id
///
/// A message that is already gone answers 200 with `already_absent`.
pub async fn delete_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<StatusResponse>> {
    let result = with_db(&state, {
        let message_id = message_id.clone();
        move |db| db.conversations.delete_message(&id, &message_id)
    })
    .await
    .map(|outcome| Json(StatusResponse { id: message_id, status: outcome }));
    track("delete_message", result)
}

/// DELETE /api/chats/:id
pub async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let result = with_db(&state, {
        let id = id.clone();
        move |db| db.conversations.delete_conversation(&id)
    })
    .await
    .map(|outcome| Json(StatusResponse { id, status: outcome }));
    track("delete_chat", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::in_memory();
        let config = state.config.clone();
        build_router(state, &config)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn message(id: &str, content: &str) -> Value {
        json!({"id": id, "sender": "user", "content": content, "timestamp": 1_700_000_000_000i64})
    }

    #[tokio::test]
    async fn test_save_then_merge_through_http() {
        let app = app();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/chats",
            Some(json!({"id": "c1", "title": "Trip", "messages": [message("a", "hi"), message("b", "there")]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": "c1", "status": "created"}));

        let (_, body) = call(
            &app,
            Method::POST,
            "/api/chats",
            Some(json!({"id": "c1", "messages": [message("b", "there"), message("c", "again")]})),
        )
        .await;
        assert_eq!(body["status"], "updated");

        let (status, chat) = call(&app, Method::GET, "/api/chats/c1", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = chat["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(chat["title"], "Trip");
    }

    #[tokio::test]
    async fn test_list_and_last() {
        let app = app();
        let (status, list) = call(&app, Method::GET, "/api/chats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list, json!([]));

        let (status, _) = call(&app, Method::GET, "/api/chats/last", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, Method::POST, "/api/chats", Some(json!({"id": "c1", "messages": [message("a", "hello")]}))).await;
        let (_, list) = call(&app, Method::GET, "/api/chats", None).await;
        assert_eq!(list[0]["id"], "c1");
        assert_eq!(list[0]["preview"], "hello");
        assert_eq!(list[0]["message_count"], 1);

        let (status, last) = call(&app, Method::GET, "/api/chats/last", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(last["id"], "c1");
    }

    #[tokio::test]
    async fn test_unknown_chat_is_404_with_error_body() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/api/chats/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (status, _) = call(&app, Method::DELETE, "/api/chats/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_context_endpoints() {
        let app = app();
        call(&app, Method::POST, "/api/chats", Some(json!({"id": "c1"}))).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/chats/c1/context",
            Some(json!({"master_rules": "be terse", "bogus": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "context_updated");

        let (status, _) = call(&app, Method::PUT, "/api/chats/c1/context", Some(json!({"bogus": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::POST,
            "/save-context",
            Some(json!({"chatId": "c1", "relations": "allies", "current_plot": null})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "context_saved");
        assert_eq!(body["updated_fields"], json!(["relations"]));

        let (_, chat) = call(&app, Method::GET, "/api/chats/c1", None).await;
        assert_eq!(chat["master_rules"], "be terse");
        assert_eq!(chat["relations"], "allies");

        let (status, _) = call(&app, Method::POST, "/save-context", Some(json!({"relations": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            "/save-context",
            Some(json!({"chatId": "nope", "relations": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rename_and_delete_flow() {
        let app = app();
        call(&app, Method::POST, "/api/chats", Some(json!({"id": "c1", "messages": [message("a", "x")]}))).await;

        let (status, _) = call(&app, Method::PUT, "/api/chats/c1/rename", Some(json!({"title": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::PUT, "/api/chats/c1/rename", Some(json!({"title": "Renamed"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": "c1", "title": "Renamed", "status": "renamed"}));

        let (status, body) = call(&app, Method::DELETE, "/api/chats/c1/messages/zzz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": "zzz", "status": "already_absent"}));

        let (_, body) = call(&app, Method::DELETE, "/api/chats/c1/messages/a", None).await;
        assert_eq!(body["status"], "deleted");

        let (status, body) = call(&app, Method::DELETE, "/api/chats/c1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "deleted");

        let (status, _) = call(&app, Method::GET, "/api/chats/c1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_context_accepts_full_client_object() {
        let app = app();
        call(&app, Method::POST, "/api/chats", Some(json!({"id": "c1"}))).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/chats/c1/context",
            Some(json!({
                "master_rules": "r",
                "aventura": "s",
                "lastCompressionTime": 1_700_000_000_000i64,
                "extra_flag": true,
                "ui": {"collapsed": [1, 2]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (_, chat) = call(&app, Method::GET, "/api/chats/c1", None).await;
        assert_eq!(chat["master_rules"], "r");
        assert_eq!(chat["aventura"], "s");
        assert_eq!(chat["lastCompressionTime"], "1700000000000");

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/chats/c1/context",
            Some(json!({"master_rules": null, "relations": ["not", "text"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::PUT, "/api/chats/c1/context", Some(json!({"aventura": null}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, chat) = call(&app, Method::GET, "/api/chats/c1", None).await;
        assert_eq!(chat["aventura"], Value::Null);
        assert_eq!(chat["master_rules"], "r");
    }

    #[tokio::test]
    async fn test_unreadable_bodies_answer_with_error_body() {
        let app = app();
        call(&app, Method::POST, "/api/chats", Some(json!({"id": "c1"}))).await;

        let malformed = Request::builder()
            .method(Method::PUT)
            .uri("/api/chats/c1/context")
            .header("content-type", "application/json")
            .body(Body::from("{\"master_rules\": "))
            .unwrap();
        let response = app.clone().oneshot(malformed).await.unwrap();
        assert!(response.status().is_client_error());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());

        let (status, body) = call(&app, Method::PUT, "/api/chats/c1/context", Some(json!(["a"]))).await;
        assert!(status.is_client_error());
        assert!(body["error"].is_string());

        let (status, body) = call(&app, Method::POST, "/api/chats", Some(json!({"messages": "nope"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());

        let (status, body) = call(&app, Method::PUT, "/api/chats/c1/rename", Some(json!({"title": 7}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());
    }

    #[test]
    fn test_context_patch_coerces_scalars_and_drops_unknown_keys() {
        let body = json!({"relations": 5, "current_plot": false, "ui": {"x": 1}, "n": 3})
            .as_object()
            .unwrap()
            .clone();
        let patch = context_patch(body, NullField::Skip).unwrap();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["relations"].as_deref(), Some("5"));
        assert_eq!(patch["current_plot"].as_deref(), Some("false"));

        let body = json!({"relations": "a", "aventura": null}).as_object().unwrap().clone();
        assert_eq!(context_patch(body.clone(), NullField::Skip).unwrap().len(), 1);
        let cleared = context_patch(body, NullField::Clear).unwrap();
        assert_eq!(cleared["aventura"], None);

        let body = json!({"aventura": null}).as_object().unwrap().clone();
        assert!(context_patch(body, NullField::Skip).is_err());

        let body = json!({"bogus": "x"}).as_object().unwrap().clone();
        let err = context_patch(body, NullField::Clear).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(msg) if msg.contains("bogus")));
    }

    #[tokio::test]
    async fn test_save_context_coerces_numbers() {
        let app = app();
        call(&app, Method::POST, "/api/chats", Some(json!({"id": "c1"}))).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/save-context",
            Some(json!({"chatId": "c1", "relations": 5, "lastCompressionTime": 1_700_000_000_000i64, "tab": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated_fields"], json!(["relations", "lastCompressionTime"]));

        let (_, chat) = call(&app, Method::GET, "/api/chats/c1", None).await;
        assert_eq!(chat["relations"], "5");
        assert_eq!(chat["lastCompressionTime"], "1700000000000");
    }
}
