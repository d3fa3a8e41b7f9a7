use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use validator::Validate;

use jobboard_core::access::{Permission, Role};
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Notification, NotificationKind};

use super::{ApiQuery, ValidJson};
use crate::auth::{authenticate, bearer_token, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::notify::NotificationStream;
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", post(read_all))
        .route("/notifications/stream", get(stream))
        .route("/notifications/:id/read", post(read_one))
        .route("/notifications/:id", delete(remove))
        .route("/admin/notifications/broadcast", post(broadcast))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    unread_only: bool,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct BroadcastRequest {
    #[validate(length(min = 1, max = 200))]
    title: String,
    #[validate(length(min = 1, max = 5000))]
    body: String,
    role: Option<Role>,
}

#[derive(Debug, Serialize)]
struct UnreadCount {
    unread_count: i64,
}

#[derive(Debug, Serialize)]
struct Updated {
    updated: u64,
}

#[derive(Debug, Serialize)]
struct Recipients {
    recipients: usize,
}

async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<Page<Notification>>> {
    let page = state
        .storage()
        .notifications()
        .list(auth.id(), query.unread_only, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

async fn unread_count(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<UnreadCount>> {
    let unread_count = state.storage().notifications().unread_count(auth.id()).await?;
    Ok(Json(UnreadCount { unread_count }))
}

async fn read_one(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .storage()
        .notifications()
        .mark_read(auth.id(), &id, state.now())
        .await
        .map_err(ApiError::missing("notification"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_all(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Updated>> {
    let updated = state
        .storage()
        .notifications()
        .mark_all_read(auth.id(), state.now())
        .await?;
    Ok(Json(Updated { updated }))
}

async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .storage()
        .notifications()
        .delete(auth.id(), &id)
        .await
        .map_err(ApiError::missing("notification"))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Live notifications for the caller. Browsers cannot set headers on an
/// `EventSource`, so the token may also come from `?token=`.
async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<StreamQuery>,
) -> ApiResult<Sse<NotificationStream>> {
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or(query.token)
        .ok_or(ApiError::Unauthorized("missing access token"))?;
    let auth = authenticate(&state, &token).await?;

    let stream = state.notifier().hub().subscribe(auth.id()).await;
    info!(stage = "notify", user_id = %auth.id(), "notification stream opened");

    let keep_alive = KeepAlive::new()
        .interval(state.settings().heartbeat)
        .text("heartbeat");
    Ok(Sse::new(stream).keep_alive(keep_alive))
}

async fn broadcast(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<BroadcastRequest>,
) -> ApiResult<(StatusCode, Json<Recipients>)> {
    auth.require(&[Permission::NotificationsBroadcast])?;
    let recipients = state.storage().users().active_ids(body.role).await?;
    let data = json!({"from": auth.id()});

    let mut delivered = 0;
    for user_id in &recipients {
        match state
            .notifier()
            .notify(
                user_id,
                NotificationKind::System,
                body.title.trim(),
                body.body.trim(),
                data.clone(),
            )
            .await
        {
            Ok(_) => delivered += 1,
            Err(err) => {
                warn!(stage = "notify", %user_id, error = %err, "broadcast delivery failed")
            }
        }
    }
    info!(stage = "notify", role = ?body.role, delivered, by = %auth.id(), "broadcast sent");
    Ok((StatusCode::ACCEPTED, Json(Recipients { recipients: delivered })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::json;
    use tokio::time::timeout;

    use jobboard_core::access::Role;
    use jobboard_core::types::NotificationKind;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn read_state_is_tracked_per_user() {
        let app = TestApp::new().await;
        let (ada, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (_, other) = app.user("bob@example.com", Role::JobSeeker).await;
        let notifier = app.state.notifier();
        let first = notifier
            .notify(&ada.id, NotificationKind::System, "One", "First", json!({}))
            .await
            .unwrap();
        notifier
            .notify(&ada.id, NotificationKind::System, "Two", "Second", json!({}))
            .await
            .unwrap();

        let (_, count) = app.get("/notifications/unread-count", Some(&token)).await;
        assert_eq!(count["unread_count"], 2);

        let read_uri = format!("/notifications/{}/read", first.id);
        assert_eq!(app.post(&read_uri, Some(&other), json!({})).await.0, StatusCode::NOT_FOUND);
        assert_eq!(app.post(&read_uri, Some(&token), json!({})).await.0, StatusCode::NO_CONTENT);

        let (_, page) = app.get("/notifications?unread_only=true", Some(&token)).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["title"], "Two");

        let (_, body) = app.post("/notifications/read-all", Some(&token), json!({})).await;
        assert_eq!(body["updated"], 1);
        let (_, count) = app.get("/notifications/unread-count", Some(&token)).await;
        assert_eq!(count["unread_count"], 0);

        let uri = format!("/notifications/{}", first.id);
        assert_eq!(app.delete(&uri, Some(&token)).await.0, StatusCode::NO_CONTENT);
        assert_eq!(app.delete(&uri, Some(&token)).await.0, StatusCode::NOT_FOUND);
        let (_, page) = app.get("/notifications", Some(&token)).await;
        assert_eq!(page["total"], 1);
    }

    #[tokio::test]
    async fn stream_delivers_new_notifications() {
        let app = TestApp::new().await;
        let (ada, token) = app.user("ada@example.com", Role::JobSeeker).await;

        let response = app
            .send(
                Request::get(format!("/notifications/stream?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(app.state.notifier().hub().connected_clients(), 1);

        let sent = app
            .state
            .notifier()
            .notify(&ada.id, NotificationKind::NewMessage, "Hi", "Hello there", json!({}))
            .await
            .unwrap();

        let mut body = response.into_body();
        let mut received = String::new();
        while !received.contains("event: notification") {
            let frame = timeout(Duration::from_secs(5), body.frame())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("frame");
            if let Ok(data) = frame.into_data() {
                received.push_str(&String::from_utf8_lossy(&data));
            }
        }
        assert!(received.contains(&format!("id: {}", sent.id)));
        assert!(received.contains("Hello there"));

        drop(body);
        assert_eq!(app.state.notifier().hub().connected_clients(), 0);
    }

    #[tokio::test]
    async fn stream_requires_a_valid_token() {
        let app = TestApp::new().await;
        let (status, _) = app.get("/notifications/stream", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app.get("/notifications/stream?token=garbage", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn broadcasts_reach_active_users_of_a_role() {
        let app = TestApp::new().await;
        let (_, admin) = app.admin().await;
        let (_, seeker) = app.user("ada@example.com", Role::JobSeeker).await;
        let (inactive, _) = app.user("gone@example.com", Role::JobSeeker).await;
        let (_, employer, _) = app.employer("owner@example.com", "Acme").await;
        app.db()
            .users()
            .set_active(&inactive.id, false, app.now())
            .await
            .unwrap();

        let (status, _) = app
            .post(
                "/admin/notifications/broadcast",
                Some(&seeker),
                json!({"title": "Hi", "body": "All"}),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .post(
                "/admin/notifications/broadcast",
                Some(&admin),
                json!({"title": "Maintenance", "body": "Tonight", "role": "job_seeker"}),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["recipients"], 1);

        let (_, page) = app.get("/notifications", Some(&seeker)).await;
        assert_eq!(page["items"][0]["kind"], "system");
        let (_, page) = app.get("/notifications", Some(&employer)).await;
        assert_eq!(page["total"], 0);

        let (_, body) = app
            .post(
                "/admin/notifications/broadcast",
                Some(&admin),
                json!({"title": "Hello", "body": "Everyone"}),
            )
            .await;
        assert_eq!(body["recipients"], 3);
    }
}
