use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, patch},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use jobboard_core::access::{Permission, Role};
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::User;
use jobboard_storage::{ProfileUpdate, UserFilter};

use super::{non_blank, ApiQuery, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users/me", get(me).patch(update_me))
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id/role", patch(set_role))
        .route("/admin/users/:id/status", patch(set_status))
        .route("/admin/users/:id", delete(delete_user))
}

#[derive(Debug, Deserialize, Validate)]
struct ProfileRequest {
    #[validate(length(min = 1, max = 200))]
    full_name: Option<String>,
    #[validate(length(max = 40))]
    phone: Option<String>,
    #[validate(url)]
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserListQuery {
    role: Option<Role>,
    q: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
struct RoleRequest {
    role: Role,
}

#[derive(Debug, Deserialize, Validate)]
struct StatusRequest {
    is_active: bool,
}

async fn me(auth: AuthUser) -> Json<User> {
    Json(auth.user)
}

async fn update_me(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<ProfileRequest>,
) -> ApiResult<Json<User>> {
    let update = ProfileUpdate {
        full_name: non_blank(body.full_name),
        phone: non_blank(body.phone),
        avatar_url: non_blank(body.avatar_url),
    };
    let user = state
        .storage()
        .users()
        .update_profile(auth.id(), update, state.now())
        .await?;
    Ok(Json(user))
}

async fn list_users(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<UserListQuery>,
) -> ApiResult<Json<Page<User>>> {
    auth.require(&[Permission::UsersRead])?;
    let filter = UserFilter {
        role: query.role,
        q: non_blank(query.q),
    };
    let page = state
        .storage()
        .users()
        .list(&filter, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

fn forbid_self(auth: &AuthUser, target: &str, action: &str) -> ApiResult<()> {
    if auth.id() == target {
        return Err(ApiError::validation(format!(
            "administrators cannot {action} themselves"
        )));
    }
    Ok(())
}

async fn set_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<RoleRequest>,
) -> ApiResult<Json<User>> {
    auth.require(&[Permission::UsersManage])?;
    forbid_self(&auth, &id, "change the role of")?;
    let user = state
        .storage()
        .users()
        .set_role(&id, body.role, state.now())
        .await
        .map_err(ApiError::missing("user"))?;
    info!(stage = "auth", user_id = %user.id, role = %user.role, by = %auth.id(), "role changed");
    Ok(Json(user))
}

async fn set_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<StatusRequest>,
) -> ApiResult<Json<User>> {
    auth.require(&[Permission::UsersManage])?;
    forbid_self(&auth, &id, "deactivate")?;
    let now = state.now();
    let user = state
        .storage()
        .users()
        .set_active(&id, body.is_active, now)
        .await
        .map_err(ApiError::missing("user"))?;
    if !body.is_active {
        state.storage().tokens().revoke_all_for_user(&id, now).await?;
    }
    info!(
        stage = "auth",
        user_id = %user.id,
        is_active = user.is_active,
        by = %auth.id(),
        "status changed"
    );
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    auth.require(&[Permission::UsersManage])?;
    forbid_self(&auth, &id, "delete")?;
    let now = state.now();
    state
        .storage()
        .users()
        .soft_delete(&id, now)
        .await
        .map_err(ApiError::missing("user"))?;
    state.storage().tokens().revoke_all_for_user(&id, now).await?;
    info!(stage = "auth", user_id = %id, by = %auth.id(), "user deleted");
    Ok(StatusCode::NO_CONTENT)
}
