use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use jobboard_core::access::{Permission, PermissionSet, Role};
use jobboard_storage::PlatformStats;

use super::ValidJson;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/stats", get(stats))
        .route(
            "/admin/roles/:role/permissions",
            get(role_permissions).put(replace_role_permissions),
        )
}

#[derive(Debug, Deserialize, Validate)]
struct RolePermissionsRequest {
    permissions: PermissionSet,
}

#[derive(Debug, Serialize)]
struct RolePermissions {
    role: Role,
    permissions: PermissionSet,
}

fn parse_role(raw: &str) -> ApiResult<Role> {
    raw.parse()
        .map_err(|_| ApiError::validation(format!("unknown role `{raw}`")))
}

async fn stats(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<PlatformStats>> {
    auth.require(&[Permission::StatsRead])?;
    Ok(Json(state.storage().stats().collect(state.now()).await?))
}

async fn role_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role): Path<String>,
) -> ApiResult<Json<RolePermissions>> {
    auth.require(&[Permission::UsersManage])?;
    let role = parse_role(&role)?;
    let permissions = state.permissions().permissions(role).await;
    Ok(Json(RolePermissions { role, permissions }))
}

async fn replace_role_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role): Path<String>,
    ValidJson(body): ValidJson<RolePermissionsRequest>,
) -> ApiResult<Json<RolePermissions>> {
    auth.require(&[Permission::UsersManage])?;
    let role = parse_role(&role)?;
    if role == Role::Admin && !body.permissions.contains(Permission::UsersManage) {
        return Err(ApiError::validation(
            "the admin role must keep users:manage",
        ));
    }

    state
        .permissions()
        .replace(state.storage(), role, body.permissions.clone())
        .await?;
    info!(
        stage = "auth",
        %role,
        count = body.permissions.len(),
        by = %auth.id(),
        "role permissions replaced"
    );
    Ok(Json(RolePermissions {
        role,
        permissions: body.permissions,
    }))
}
