use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use jobboard_core::access::Permission;
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::BlogPost;
use jobboard_storage::{NewPost, PostUpdate};

use super::{non_blank, ApiQuery, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

// GET resolves `:key` as a slug, the write routes as an id.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/blog", get(list_posts).post(create_post))
        .route(
            "/blog/:key",
            get(show_post).patch(update_post).delete(delete_post),
        )
        .route("/blog/:key/publish", post(publish_post))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    q: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
struct CreatePostRequest {
    #[validate(length(min = 1, max = 200))]
    title: String,
    #[validate(length(max = 500))]
    excerpt: Option<String>,
    #[validate(length(min = 1, max = 100000))]
    content: String,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdatePostRequest {
    #[validate(length(min = 1, max = 200))]
    title: Option<String>,
    #[validate(length(max = 500))]
    excerpt: Option<String>,
    #[validate(length(min = 1, max = 100000))]
    content: Option<String>,
}

/// Loads a post the caller may edit: its author holding `blog:create`, or
/// anyone holding `blog:manage`.
async fn editable_post(state: &AppState, auth: &AuthUser, id: &str) -> ApiResult<BlogPost> {
    let post = state
        .storage()
        .blog()
        .find(id)
        .await?
        .ok_or(ApiError::NotFound("post"))?;
    let is_author =
        post.author_id == auth.user.id && auth.permissions.contains(Permission::BlogCreate);
    if is_author || auth.permissions.contains(Permission::BlogManage) {
        Ok(post)
    } else {
        Err(ApiError::forbidden("you cannot edit this post"))
    }
}

async fn list_posts(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<Page<BlogPost>>> {
    let page = state
        .storage()
        .blog()
        .list_published(query.q.as_deref(), PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

async fn show_post(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<BlogPost>> {
    let post = state
        .storage()
        .blog()
        .find_published_by_slug(&slug)
        .await?
        .ok_or(ApiError::NotFound("post"))?;
    Ok(Json(post))
}

async fn create_post(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<CreatePostRequest>,
) -> ApiResult<(StatusCode, Json<BlogPost>)> {
    auth.require(&[Permission::BlogCreate])?;
    let post = state
        .storage()
        .blog()
        .insert(NewPost {
            author_id: auth.id().to_string(),
            title: body.title.trim().to_string(),
            excerpt: non_blank(body.excerpt),
            content: body.content,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "app", post_id = %post.id, slug = %post.slug, "blog draft created");
    Ok((StatusCode::CREATED, Json(post)))
}

async fn update_post(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<UpdatePostRequest>,
) -> ApiResult<Json<BlogPost>> {
    let post = editable_post(&state, &auth, &id).await?;
    let update = PostUpdate {
        title: non_blank(body.title),
        excerpt: non_blank(body.excerpt),
        content: body.content,
    };
    let post = state.storage().blog().update(&post.id, update, state.now()).await?;
    Ok(Json(post))
}

async fn delete_post(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let post = editable_post(&state, &auth, &id).await?;
    state.storage().blog().soft_delete(&post.id, state.now()).await?;
    info!(stage = "app", post_id = %post.id, by = %auth.id(), "blog post deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn publish_post(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<BlogPost>> {
    auth.require(&[Permission::BlogPublish])?;
    let post = state
        .storage()
        .blog()
        .publish(&id, state.now())
        .await
        .map_err(ApiError::missing("post"))?;
    info!(stage = "app", post_id = %post.id, "blog post published");
    Ok(Json(post))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Duration;
    use serde_json::json;

    use jobboard_core::access::Role;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn drafts_are_hidden_until_published() {
        let app = TestApp::new().await;
        let (_, admin) = app.admin().await;
        let (_, author, _) = app.employer("writer@example.com", "Acme").await;

        let (status, post) = app
            .post(
                "/blog",
                Some(&author),
                json!({"title": "Hiring in 2024!", "content": "We are growing."}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(post["slug"], "hiring-in-2024");
        assert_eq!(post["status"], "draft");
        let id = post["id"].as_str().unwrap();

        assert_eq!(app.get("/blog/hiring-in-2024", None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            app.post(&format!("/blog/{id}/publish"), Some(&author), json!({})).await.0,
            StatusCode::FORBIDDEN
        );

        let (status, published) = app
            .post(&format!("/blog/{id}/publish"), Some(&admin), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(published["status"], "published");
        let first_published = published["published_at"].clone();

        app.advance(Duration::hours(1));
        let (_, again) = app
            .post(&format!("/blog/{id}/publish"), Some(&admin), json!({}))
            .await;
        assert_eq!(again["published_at"], first_published);

        let (status, body) = app.get("/blog/hiring-in-2024", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "We are growing.");

        let (_, page) = app.get("/blog?q=GROWING", None).await;
        assert_eq!(page["total"], 1);
        let (_, page) = app.get("/blog?q=layoffs", None).await;
        assert_eq!(page["total"], 0);
    }

    #[tokio::test]
    async fn only_authors_and_managers_edit_posts() {
        let app = TestApp::new().await;
        let (_, admin) = app.admin().await;
        let (_, author, _) = app.employer("writer@example.com", "Acme").await;
        let (_, other, _) = app.employer("other@example.com", "Globex").await;
        let (_, seeker) = app.user("ada@example.com", Role::JobSeeker).await;

        assert_eq!(
            app.post("/blog", Some(&seeker), json!({"title": "T", "content": "C"})).await.0,
            StatusCode::FORBIDDEN
        );

        let (_, post) = app
            .post("/blog", Some(&author), json!({"title": "Culture", "content": "Text"}))
            .await;
        let uri = format!("/blog/{}", post["id"].as_str().unwrap());

        assert_eq!(
            app.patch(&uri, Some(&other), json!({"title": "Mine"})).await.0,
            StatusCode::FORBIDDEN
        );
        let (status, body) = app
            .patch(&uri, Some(&author), json!({"excerpt": "Short"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["excerpt"], "Short");
        assert_eq!(body["slug"], "culture");

        let (status, body) = app
            .patch(&uri, Some(&admin), json!({"title": "Our Culture"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slug"], "culture");

        assert_eq!(app.delete(&uri, Some(&other)).await.0, StatusCode::FORBIDDEN);
        assert_eq!(app.delete(&uri, Some(&author)).await.0, StatusCode::NO_CONTENT);
        assert_eq!(
            app.patch(&uri, Some(&author), json!({"title": "Back"})).await.0,
            StatusCode::NOT_FOUND
        );
    }
}
