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
use jobboard_core::types::Cv;
use jobboard_storage::{CvUpdate, NewCv};

use super::{non_blank, nullable, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cvs", post(create_cv).get(list_cvs))
        .route("/cvs/:id", get(show_cv).patch(update_cv).delete(delete_cv))
        .route("/cvs/:id/default", post(make_default))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateCvRequest {
    #[validate(length(min = 1, max = 200))]
    title: String,
    #[validate(length(max = 5000))]
    summary: Option<String>,
    #[serde(default)]
    #[validate(length(max = 50))]
    skills: Vec<String>,
    #[serde(default)]
    #[validate(range(min = 0, max = 80))]
    experience_years: i64,
    #[validate(length(max = 2000))]
    education: Option<String>,
    upload_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateCvRequest {
    #[validate(length(min = 1, max = 200))]
    title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[validate(length(max = 5000))]
    summary: Option<Option<String>>,
    #[validate(length(max = 50))]
    skills: Option<Vec<String>>,
    #[validate(range(min = 0, max = 80))]
    experience_years: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    #[validate(length(max = 2000))]
    education: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    upload_id: Option<Option<String>>,
}

fn clean_skills(skills: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(skills.len());
    for skill in skills {
        let skill = skill.trim();
        if !skill.is_empty() && !cleaned.iter().any(|seen| seen.eq_ignore_ascii_case(skill)) {
            cleaned.push(skill.to_string());
        }
    }
    cleaned
}

/// Checks that an attached file was uploaded by the caller.
async fn owned_upload(
    state: &AppState,
    auth: &AuthUser,
    upload_id: Option<String>,
) -> ApiResult<Option<String>> {
    let Some(upload_id) = non_blank(upload_id) else {
        return Ok(None);
    };
    let upload = state
        .storage()
        .uploads()
        .find(&upload_id)
        .await?
        .filter(|upload| upload.owner_id == auth.user.id)
        .ok_or_else(|| ApiError::validation("upload does not belong to you"))?;
    Ok(Some(upload.id))
}

async fn own_cv(state: &AppState, auth: &AuthUser, id: &str) -> ApiResult<Cv> {
    state
        .storage()
        .cvs()
        .find(id)
        .await?
        .filter(|cv| cv.user_id == auth.user.id)
        .ok_or(ApiError::NotFound("cv"))
}

async fn create_cv(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<CreateCvRequest>,
) -> ApiResult<(StatusCode, Json<Cv>)> {
    auth.require(&[Permission::CvsManage])?;
    let upload_id = owned_upload(&state, &auth, body.upload_id).await?;
    let cv = state
        .storage()
        .cvs()
        .insert(NewCv {
            user_id: auth.id().to_string(),
            title: body.title.trim().to_string(),
            summary: non_blank(body.summary),
            skills: clean_skills(body.skills),
            experience_years: body.experience_years,
            education: non_blank(body.education),
            upload_id,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "app", cv_id = %cv.id, is_default = cv.is_default, "cv created");
    Ok((StatusCode::CREATED, Json(cv)))
}

async fn list_cvs(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Vec<Cv>>> {
    auth.require(&[Permission::CvsManage])?;
    Ok(Json(state.storage().cvs().list_for_user(auth.id()).await?))
}

async fn show_cv(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Cv>> {
    let cv = state
        .storage()
        .cvs()
        .find(&id)
        .await?
        .ok_or(ApiError::NotFound("cv"))?;
    if cv.user_id == auth.user.id || auth.is_admin() {
        return Ok(Json(cv));
    }

    let shared = match auth.user.company_id.as_deref() {
        Some(company_id) if auth.permissions.contains(Permission::CvsRead) => {
            state
                .storage()
                .applications()
                .cv_shared_with_company(&cv.id, company_id)
                .await?
        }
        _ => false,
    };
    if shared {
        Ok(Json(cv))
    } else {
        Err(ApiError::NotFound("cv"))
    }
}

async fn update_cv(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<UpdateCvRequest>,
) -> ApiResult<Json<Cv>> {
    auth.require(&[Permission::CvsManage])?;
    let cv = own_cv(&state, &auth, &id).await?;
    let update = CvUpdate {
        title: non_blank(body.title),
        summary: body.summary.map(non_blank),
        skills: body.skills.map(clean_skills),
        experience_years: body.experience_years,
        education: body.education.map(non_blank),
        upload_id: match body.upload_id {
            Some(upload_id) => Some(owned_upload(&state, &auth, upload_id).await?),
            None => None,
        },
    };
    let cv = state.storage().cvs().update(&cv.id, update, state.now()).await?;
    Ok(Json(cv))
}

async fn delete_cv(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    auth.require(&[Permission::CvsManage])?;
    state
        .storage()
        .cvs()
        .soft_delete(auth.id(), &id, state.now())
        .await
        .map_err(ApiError::missing("cv"))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn make_default(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Cv>> {
    auth.require(&[Permission::CvsManage])?;
    let cv = state
        .storage()
        .cvs()
        .set_default(auth.id(), &id, state.now())
        .await
        .map_err(ApiError::missing("cv"))?;
    Ok(Json(cv))
}
