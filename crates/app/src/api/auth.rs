use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Duration;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use jobboard_core::access::Role;
use jobboard_core::template::MailTemplate;
use jobboard_core::types::User;
use jobboard_storage::{NewToken, NewUser};

use super::{email_address, normalize_email, ValidJson};
use crate::auth::{generate_opaque_token, hash_opaque_token, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/change-password", post(change_password))
}

#[derive(Debug, Deserialize, Validate)]
struct RegisterRequest {
    #[validate(custom = "email_address")]
    email: String,
    #[validate(length(min = 8, max = 128))]
    password: String,
    #[validate(length(min = 1, max = 200))]
    full_name: String,
    role: Role,
}

#[derive(Debug, Deserialize, Validate)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize, Validate)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Deserialize, Validate)]
struct ForgotPasswordRequest {
    #[validate(custom = "email_address")]
    email: String,
}

#[derive(Debug, Deserialize, Validate)]
struct ResetPasswordRequest {
    token: String,
    #[validate(length(min = 8, max = 128))]
    new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
struct ChangePasswordRequest {
    current_password: String,
    #[validate(length(min = 8, max = 128))]
    new_password: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    user: User,
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: i64,
}

async fn register(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    if !body.role.is_self_assignable() {
        return Err(ApiError::validation(format!(
            "role {} cannot be chosen at registration",
            body.role
        )));
    }
    let full_name = body.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(ApiError::validation("full_name must not be blank"));
    }

    let password_hash = state.passwords().hash(&body.password).await?;
    let user = state
        .storage()
        .users()
        .insert(NewUser {
            email: normalize_email(&body.email),
            password_hash,
            full_name,
            role: body.role,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "auth", user_id = %user.id, role = %user.role, "user registered");

    let vars = HashMap::from([
        ("name", user.full_name.clone()),
        ("role", user.role.to_string()),
        ("link", format!("{}/login", state.settings().frontend_url)),
    ]);
    state.mailer().send(&user.email, MailTemplate::Welcome, &vars).await;

    let session = issue_session(&state, user).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn login(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<LoginRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let credentials = state
        .storage()
        .users()
        .find_credentials(&normalize_email(&body.email))
        .await?;
    let Some((user, password_hash)) = credentials else {
        return Err(login_failed("unknown_email"));
    };
    if !state.passwords().verify(&body.password, &password_hash).await? {
        return Err(login_failed("wrong_password"));
    }
    if !user.can_sign_in() {
        return Err(login_failed("inactive_user"));
    }

    let now = state.now();
    state.storage().users().record_login(&user.id, now).await?;
    let user = User {
        last_login_at: Some(now),
        ..user
    };
    info!(stage = "auth", user_id = %user.id, "user signed in");
    Ok(Json(issue_session(&state, user).await?))
}

fn login_failed(reason: &'static str) -> ApiError {
    counter!("http_auth_failures_total", "reason" => reason).increment(1);
    ApiError::Unauthorized("invalid email or password")
}

async fn refresh(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<RefreshRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let now = state.now();
    let user_id = state
        .storage()
        .tokens()
        .consume_refresh(&hash_opaque_token(&body.refresh_token), now)
        .await?
        .ok_or_else(|| {
            counter!("http_auth_failures_total", "reason" => "invalid_refresh_token").increment(1);
            ApiError::Unauthorized("invalid or expired refresh token")
        })?;

    let user = state
        .storage()
        .users()
        .find_by_id(&user_id)
        .await?
        .filter(User::can_sign_in)
        .ok_or(ApiError::Unauthorized("account is not active"))?;
    Ok(Json(issue_session(&state, user).await?))
}

async fn logout(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<RefreshRequest>,
) -> ApiResult<StatusCode> {
    state
        .storage()
        .tokens()
        .revoke_refresh(&hash_opaque_token(&body.refresh_token), state.now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn forgot_password(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<ForgotPasswordRequest>,
) -> ApiResult<StatusCode> {
    let credentials = state
        .storage()
        .users()
        .find_credentials(&normalize_email(&body.email))
        .await?;
    let Some((user, _)) = credentials.filter(|(user, _)| user.can_sign_in()) else {
        return Ok(StatusCode::ACCEPTED);
    };

    let now = state.now();
    let minutes = state.settings().reset_ttl_minutes;
    let token = generate_opaque_token();
    state
        .storage()
        .tokens()
        .insert_reset(NewToken {
            user_id: &user.id,
            token_hash: &hash_opaque_token(&token),
            expires_at: now + Duration::minutes(minutes),
            created_at: now,
        })
        .await?;

    let vars = HashMap::from([
        ("name", user.full_name.clone()),
        (
            "link",
            format!("{}/reset-password?token={token}", state.settings().frontend_url),
        ),
        ("minutes", minutes.to_string()),
    ]);
    state
        .mailer()
        .send(&user.email, MailTemplate::PasswordReset, &vars)
        .await;
    info!(stage = "auth", user_id = %user.id, "password reset requested");
    Ok(StatusCode::ACCEPTED)
}

async fn reset_password(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<ResetPasswordRequest>,
) -> ApiResult<StatusCode> {
    let now = state.now();
    let user_id = state
        .storage()
        .tokens()
        .consume_reset(&hash_opaque_token(&body.token), now)
        .await?
        .ok_or_else(|| ApiError::validation("invalid or expired reset token"))?;

    let password_hash = state.passwords().hash(&body.new_password).await?;
    let users = state.storage().users();
    users.update_password(&user_id, &password_hash, now).await?;
    let revoked = state
        .storage()
        .tokens()
        .revoke_all_for_user(&user_id, now)
        .await?;
    info!(stage = "auth", %user_id, revoked, "password reset");
    Ok(StatusCode::NO_CONTENT)
}

async fn change_password(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    let users = state.storage().users();
    let stored = users.password_hash(auth.id()).await?;
    if !state
        .passwords()
        .verify(&body.current_password, &stored)
        .await?
    {
        return Err(ApiError::Unauthorized("current password is incorrect"));
    }

    let password_hash = state.passwords().hash(&body.new_password).await?;
    users
        .update_password(auth.id(), &password_hash, state.now())
        .await?;
    info!(stage = "auth", user_id = %auth.id(), "password changed");
    Ok(StatusCode::NO_CONTENT)
}

async fn issue_session(state: &AppState, user: User) -> ApiResult<SessionResponse> {
    let now = state.now();
    let access_token = state.tokens().issue(&user, now)?;
    let refresh_token = generate_opaque_token();
    state
        .storage()
        .tokens()
        .insert_refresh(NewToken {
            user_id: &user.id,
            token_hash: &hash_opaque_token(&refresh_token),
            expires_at: now + Duration::days(state.settings().refresh_ttl_days),
            created_at: now,
        })
        .await?;

    Ok(SessionResponse {
        user,
        access_token,
        refresh_token,
        token_type: "Bearer",
        expires_in: state.tokens().access_ttl_secs(),
    })
}
