use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use validator::Validate;

use jobboard_core::access::Permission;
use jobboard_core::application::{Actor, ApplicationStatus};
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::template::MailTemplate;
use jobboard_core::types::{Application, NotificationKind};
use jobboard_storage::{ApplicationView, NewApplication};

use super::{non_blank, ApiQuery, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/:id/applications", post(apply).get(list_for_job))
        .route("/applications/me", get(list_mine))
        .route("/applications/:id", get(show))
        .route("/applications/:id/status", patch(update_status))
        .route("/applications/:id/withdraw", post(withdraw))
}

#[derive(Debug, Deserialize, Validate)]
struct ApplyRequest {
    cv_id: Option<String>,
    #[validate(length(max = 5000))]
    cover_letter: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct StatusRequest {
    status: ApplicationStatus,
    #[validate(length(max = 2000))]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<ApplicationStatus>,
    page: Option<u32>,
    limit: Option<u32>,
}

async fn load_view(state: &AppState, id: &str) -> ApiResult<ApplicationView> {
    state
        .storage()
        .applications()
        .find_view(id)
        .await?
        .ok_or(ApiError::NotFound("application"))
}

async fn apply(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(job_id): Path<String>,
    ValidJson(body): ValidJson<ApplyRequest>,
) -> ApiResult<(StatusCode, Json<ApplicationView>)> {
    auth.require(&[Permission::ApplicationsApply])?;
    let now = state.now();
    let job = state
        .storage()
        .jobs()
        .find(&job_id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    if !job.is_active(now) {
        return Err(ApiError::validation("job is not accepting applications"));
    }

    let cvs = state.storage().cvs();
    let cv_id = match non_blank(body.cv_id) {
        Some(cv_id) => {
            let cv = cvs
                .find(&cv_id)
                .await?
                .filter(|cv| cv.user_id == auth.user.id)
                .ok_or_else(|| ApiError::validation("cv does not belong to you"))?;
            Some(cv.id)
        }
        None => cvs.default_for_user(auth.id()).await?.map(|cv| cv.id),
    };

    let application = state
        .storage()
        .applications()
        .insert(NewApplication {
            job_id: job.id.clone(),
            applicant_id: auth.id().to_string(),
            cv_id,
            cover_letter: non_blank(body.cover_letter),
            created_at: now,
        })
        .await?;
    counter!("applications_submitted_total").increment(1);
    info!(
        stage = "applications",
        application_id = %application.id,
        job_id = %job.id,
        "application submitted"
    );

    let view = load_view(&state, &application.id).await?;
    if let Err(err) = state
        .notifier()
        .notify(
            &job.posted_by,
            NotificationKind::ApplicationReceived,
            "New application",
            format!("{} applied to {}", view.applicant_name, view.job_title),
            json!({"application_id": view.application.id, "job_id": job.id}),
        )
        .await
    {
        warn!(stage = "notify", error = %err, "failed to notify job poster");
    }

    let vars = HashMap::from([
        ("name", view.applicant_name.clone()),
        ("job_title", view.job_title.clone()),
        ("company", view.company_name.clone()),
    ]);
    state
        .mailer()
        .send(&view.applicant_email, MailTemplate::ApplicationReceived, &vars)
        .await;

    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_mine(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<Page<ApplicationView>>> {
    let page = state
        .storage()
        .applications()
        .list_for_applicant(auth.id(), query.status, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

async fn list_for_job(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(job_id): Path<String>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Json<Page<ApplicationView>>> {
    auth.require(&[Permission::ApplicationsRead])?;
    let job = state
        .storage()
        .jobs()
        .find(&job_id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    if !auth.can_act_for(&job.company_id) {
        return Err(ApiError::forbidden("you are not a member of this company"));
    }
    let page = state
        .storage()
        .applications()
        .list_for_job(&job.id, query.status, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

async fn show(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ApplicationView>> {
    let view = load_view(&state, &id).await?;
    if view.application.applicant_id != auth.user.id && !auth.can_act_for(&view.company_id) {
        return Err(ApiError::NotFound("application"));
    }
    Ok(Json(view))
}

async fn update_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<StatusRequest>,
) -> ApiResult<Json<ApplicationView>> {
    auth.require(&[Permission::ApplicationsManage])?;
    let view = load_view(&state, &id).await?;
    if !auth.can_act_for(&view.company_id) {
        return Err(ApiError::forbidden("you are not a member of this company"));
    }

    let from = view.application.status;
    let to = from.transition(body.status, Actor::Employer)?;
    let note = non_blank(body.note);
    state
        .storage()
        .applications()
        .update_status(&id, from, to, note.clone(), state.now())
        .await?;
    counter!("application_status_changes_total", "status" => to.as_str()).increment(1);
    info!(
        stage = "applications",
        application_id = %id,
        %from,
        %to,
        by = %auth.id(),
        "status changed"
    );

    let view = load_view(&state, &id).await?;
    if let Err(err) = state
        .notifier()
        .notify(
            &view.application.applicant_id,
            NotificationKind::ApplicationStatusChanged,
            "Application updated",
            format!("Your application for {} is now {}", view.job_title, to),
            json!({"application_id": view.application.id, "status": to}),
        )
        .await
    {
        warn!(stage = "notify", error = %err, "failed to notify applicant");
    }

    let vars = HashMap::from([
        ("name", view.applicant_name.clone()),
        ("job_title", view.job_title.clone()),
        ("status", to.to_string()),
        ("note", note.unwrap_or_default()),
    ]);
    state
        .mailer()
        .send(&view.applicant_email, MailTemplate::ApplicationStatusChanged, &vars)
        .await;

    Ok(Json(view))
}

async fn withdraw(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Application>> {
    auth.require(&[Permission::ApplicationsWithdraw])?;
    let applications = state.storage().applications();
    let application = applications
        .find(&id)
        .await?
        .filter(|application| application.applicant_id == auth.user.id)
        .ok_or(ApiError::NotFound("application"))?;

    let to = application
        .status
        .transition(ApplicationStatus::Withdrawn, Actor::Applicant)?;
    let application = applications
        .update_status(&id, application.status, to, None, state.now())
        .await?;
    info!(stage = "applications", application_id = %id, "application withdrawn");
    Ok(Json(application))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use jobboard_core::access::Role;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn applying_uses_the_default_cv_and_notifies_both_sides() {
        let app = TestApp::new().await;
        let (owner, owner_token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.published_job(&company, &owner, "Rust Engineer").await;
        let (seeker, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let cv = app.cv(&seeker, "Backend").await;

        let uri = format!("/jobs/{}/applications", job.id);
        let (status, body) = app
            .post(&uri, Some(&token), json!({"cover_letter": "Hello"}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["cv_id"], cv.id.as_str());
        assert_eq!(body["company_name"], "Acme");

        let (status, _) = app.post(&uri, Some(&token), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, count) = app
            .get("/notifications/unread-count", Some(&owner_token))
            .await;
        assert_eq!(count["unread_count"], 1);

        let mail = app.sent_mail();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].to, "ada@example.com");
        assert!(mail[0].subject.contains("Rust Engineer"));
    }

    #[tokio::test]
    async fn applications_need_an_active_job_and_an_owned_cv() {
        let app = TestApp::new().await;
        let (owner, _, company) = app.employer("owner@example.com", "Acme").await;
        let draft = app.draft_job(&company, &owner, "Draft").await;
        let live = app.published_job(&company, &owner, "Live").await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (other, _) = app.user("bob@example.com", Role::JobSeeker).await;
        let foreign = app.cv(&other, "Not mine").await;

        let (status, _) = app
            .post(&format!("/jobs/{}/applications", draft.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .post(
                &format!("/jobs/{}/applications", live.id),
                Some(&token),
                json!({"cv_id": foreign.id}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "cv does not belong to you");

        let (status, _) = app
            .post("/jobs/missing/applications", Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn employers_walk_the_status_machine() {
        let app = TestApp::new().await;
        let (owner, owner_token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.published_job(&company, &owner, "Rust Engineer").await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (_, body) = app
            .post(&format!("/jobs/{}/applications", job.id), Some(&token), json!({}))
            .await;
        let uri = format!("/applications/{}/status", body["id"].as_str().unwrap());

        let (status, body) = app
            .patch(&uri, Some(&owner_token), json!({"status": "accepted"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["detail"], "cannot move application from pending to accepted");

        let (status, _) = app
            .patch(&uri, Some(&owner_token), json!({"status": "withdrawn"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        for next in ["reviewing", "shortlisted", "accepted"] {
            let (status, body) = app
                .patch(&uri, Some(&owner_token), json!({"status": next, "note": "Great fit"}))
                .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], next);
            assert_eq!(body["employer_note"], "Great fit");
        }

        let (_, notes) = app.get("/notifications", Some(&token)).await;
        assert_eq!(notes["total"], 3);
        let status_mail = app
            .sent_mail()
            .into_iter()
            .filter(|mail| mail.subject.contains("is now"))
            .count();
        assert_eq!(status_mail, 3);
    }

    #[tokio::test]
    async fn outsiders_cannot_see_or_manage_applications() {
        let app = TestApp::new().await;
        let (owner, _, company) = app.employer("owner@example.com", "Acme").await;
        let (_, outsider, _) = app.employer("other@example.com", "Globex").await;
        let (_, hr_token) = app.hr("hr@example.com", &company).await;
        let job = app.published_job(&company, &owner, "Rust Engineer").await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (_, body) = app
            .post(&format!("/jobs/{}/applications", job.id), Some(&token), json!({}))
            .await;
        let id = body["id"].as_str().unwrap().to_string();

        assert_eq!(
            app.get(&format!("/applications/{id}"), Some(&outsider)).await.0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            app.patch(
                &format!("/applications/{id}/status"),
                Some(&outsider),
                json!({"status": "reviewing"})
            )
            .await
            .0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            app.get(&format!("/jobs/{}/applications", job.id), Some(&outsider))
                .await
                .0,
            StatusCode::FORBIDDEN
        );

        let (status, page) = app
            .get(
                &format!("/jobs/{}/applications?status=pending", job.id),
                Some(&hr_token),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(
            app.get(&format!("/applications/{id}"), Some(&hr_token)).await.0,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn applicants_withdraw_their_own_applications() {
        let app = TestApp::new().await;
        let (owner, owner_token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.published_job(&company, &owner, "Rust Engineer").await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (_, other) = app.user("bob@example.com", Role::JobSeeker).await;
        let (_, body) = app
            .post(&format!("/jobs/{}/applications", job.id), Some(&token), json!({}))
            .await;
        let uri = format!("/applications/{}/withdraw", body["id"].as_str().unwrap());

        assert_eq!(app.post(&uri, Some(&other), json!({})).await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            app.post(&uri, Some(&owner_token), json!({})).await.0,
            StatusCode::FORBIDDEN
        );

        let (status, body) = app.post(&uri, Some(&token), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "withdrawn");
        assert_eq!(app.post(&uri, Some(&token), json!({})).await.0, StatusCode::CONFLICT);

        let (_, mine) = app.get("/applications/me?status=withdrawn", Some(&token)).await;
        assert_eq!(mine["total"], 1);
        assert_eq!(mine["items"][0]["job_title"], "Rust Engineer");
    }
}
