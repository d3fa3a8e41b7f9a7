use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use validator::Validate;

use jobboard_core::access::Permission;
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Conversation, Message, NotificationKind, User};

use super::{ApiQuery, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/messages", post(send))
        .route("/messages/conversations", get(conversations))
        .route("/messages/with/:user_id", get(thread))
}

const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Deserialize, Validate)]
struct SendRequest {
    recipient_id: String,
    #[validate(length(min = 1, max = 5000))]
    body: String,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

fn preview(body: &str) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

async fn counterpart(state: &AppState, id: &str) -> ApiResult<User> {
    state
        .storage()
        .users()
        .find_by_id(id)
        .await?
        .filter(User::can_sign_in)
        .ok_or(ApiError::NotFound("user"))
}

async fn send(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<SendRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    auth.require(&[Permission::MessagesSend])?;
    if body.recipient_id == auth.user.id {
        return Err(ApiError::validation("you cannot message yourself"));
    }
    let text = body.body.trim();
    if text.is_empty() {
        return Err(ApiError::validation("message body must not be blank"));
    }
    let recipient = counterpart(&state, &body.recipient_id).await?;

    let message = state
        .storage()
        .messages()
        .insert(auth.id(), &recipient.id, text, state.now())
        .await?;
    debug!(stage = "app", message_id = %message.id, to = %recipient.id, "message sent");

    if let Err(err) = state
        .notifier()
        .notify(
            &recipient.id,
            NotificationKind::NewMessage,
            format!("New message from {}", auth.user.full_name),
            preview(&message.body),
            json!({"message_id": message.id, "sender_id": auth.id()}),
        )
        .await
    {
        warn!(stage = "notify", error = %err, "failed to notify message recipient");
    }
    Ok((StatusCode::CREATED, Json(message)))
}

async fn conversations(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<Conversation>>> {
    Ok(Json(state.storage().messages().conversations(auth.id()).await?))
}

async fn thread(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<String>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> ApiResult<Json<Page<Message>>> {
    let messages = state.storage().messages();
    messages.mark_thread_read(auth.id(), &user_id, state.now()).await?;
    let page = messages
        .thread(auth.id(), &user_id, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}
