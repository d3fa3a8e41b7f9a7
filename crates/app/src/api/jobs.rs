use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use jobboard_core::access::Permission;
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::search::{JobSearch, JobSort};
use jobboard_core::types::{
    salary_band_is_valid, EmploymentType, ExperienceLevel, Job, JobStatus, Plan,
};
use jobboard_storage::{JobUpdate, NewJob, PublishLimits, PublishOutcome};

use super::subscriptions::effective_plan;
use super::{load_company, non_blank, nullable, ApiQuery, ValidJson};
use crate::auth::{AuthUser, MaybeAuthUser};
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job).get(search_jobs))
        .route(
            "/jobs/:id",
            get(show_job).patch(update_job).delete(delete_job),
        )
        .route("/jobs/:id/publish", post(publish_job))
        .route("/jobs/:id/close", post(close_job))
        .route("/companies/:id/jobs", get(company_jobs))
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize, Validate)]
struct CreateJobRequest {
    company_id: Option<String>,
    #[validate(length(min = 1, max = 200))]
    title: String,
    #[validate(length(min = 1, max = 20000))]
    description: String,
    #[validate(length(max = 10000))]
    requirements: Option<String>,
    #[validate(length(min = 1, max = 200))]
    location: String,
    employment_type: EmploymentType,
    experience_level: ExperienceLevel,
    salary_min: Option<i64>,
    salary_max: Option<i64>,
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    currency: String,
    #[serde(default)]
    is_remote: bool,
    #[serde(default)]
    is_featured: bool,
    deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateJobRequest {
    #[validate(length(min = 1, max = 200))]
    title: Option<String>,
    #[validate(length(min = 1, max = 20000))]
    description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    #[validate(length(max = 10000))]
    requirements: Option<Option<String>>,
    #[validate(length(min = 1, max = 200))]
    location: Option<String>,
    employment_type: Option<EmploymentType>,
    experience_level: Option<ExperienceLevel>,
    #[serde(default, deserialize_with = "nullable")]
    salary_min: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    salary_max: Option<Option<i64>>,
    #[validate(length(equal = 3))]
    currency: Option<String>,
    is_remote: Option<bool>,
    is_featured: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    deadline: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Deserialize)]
struct JobSearchQuery {
    q: Option<String>,
    location: Option<String>,
    employment_type: Option<EmploymentType>,
    experience_level: Option<ExperienceLevel>,
    is_remote: Option<bool>,
    company_id: Option<String>,
    salary_min: Option<i64>,
    salary_max: Option<i64>,
    sort: Option<JobSort>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

/// Job plus the derived fields clients display.
#[derive(Debug, Serialize)]
pub(crate) struct JobResponse {
    #[serde(flatten)]
    job: Job,
    salary_range: String,
    is_active: bool,
}

impl JobResponse {
    fn new(job: Job, now: DateTime<Utc>) -> Self {
        Self {
            salary_range: job.salary_range(),
            is_active: job.is_active(now),
            job,
        }
    }
}

/// Loads a live job the caller may manage.
async fn managed_job(state: &AppState, auth: &AuthUser, id: &str) -> ApiResult<Job> {
    let job = state
        .storage()
        .jobs()
        .find(id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    if !auth.can_act_for(&job.company_id) {
        return Err(ApiError::forbidden("you are not a member of this company"));
    }
    Ok(job)
}

async fn create_job(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    auth.require(&[Permission::JobsCreate])?;
    let company_id = non_blank(body.company_id)
        .or_else(|| auth.user.company_id.clone())
        .ok_or_else(|| ApiError::validation("company_id is required"))?;
    if !auth.can_act_for(&company_id) {
        return Err(ApiError::forbidden("you are not a member of this company"));
    }
    let company = load_company(&state, &company_id).await?;

    if !salary_band_is_valid(body.salary_min, body.salary_max) {
        return Err(ApiError::validation(
            "salary_min must not exceed salary_max and neither may be negative",
        ));
    }

    let now = state.now();
    let job = state
        .storage()
        .jobs()
        .insert(NewJob {
            company_id: company.id,
            posted_by: auth.id().to_string(),
            title: body.title.trim().to_string(),
            description: body.description,
            requirements: non_blank(body.requirements),
            location: body.location.trim().to_string(),
            employment_type: body.employment_type,
            experience_level: body.experience_level,
            salary_min: body.salary_min,
            salary_max: body.salary_max,
            currency: body.currency.to_uppercase(),
            is_remote: body.is_remote,
            is_featured: body.is_featured,
            deadline: body.deadline,
            created_at: now,
        })
        .await?;
    info!(stage = "jobs", job_id = %job.id, company_id = %job.company_id, "job drafted");
    Ok((StatusCode::CREATED, Json(JobResponse::new(job, now))))
}

async fn update_job(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<UpdateJobRequest>,
) -> ApiResult<Json<JobResponse>> {
    auth.require(&[Permission::JobsUpdate])?;
    let job = managed_job(&state, &auth, &id).await?;
    let now = state.now();

    let salary_min = body.salary_min.unwrap_or(job.salary_min);
    let salary_max = body.salary_max.unwrap_or(job.salary_max);
    if !salary_band_is_valid(salary_min, salary_max) {
        return Err(ApiError::validation(
            "salary_min must not exceed salary_max and neither may be negative",
        ));
    }

    let becomes_featured = body.is_featured == Some(true) && !job.is_featured;
    if job.status == JobStatus::Published && becomes_featured {
        let (plan, _) = effective_plan(&state, &job.company_id, now).await?;
        let featured = state.storage().jobs().count_featured(&job.company_id).await?;
        if !plan.allows_featured(featured) {
            return Err(featured_quota(&plan.name, plan.featured_job_limit));
        }
    }

    let update = JobUpdate {
        title: non_blank(body.title),
        description: non_blank(body.description),
        requirements: body.requirements.map(non_blank),
        location: non_blank(body.location),
        employment_type: body.employment_type,
        experience_level: body.experience_level,
        salary_min: body.salary_min,
        salary_max: body.salary_max,
        currency: body.currency.map(|currency| currency.to_uppercase()),
        is_remote: body.is_remote,
        is_featured: body.is_featured,
        deadline: body.deadline,
    };
    let job = state.storage().jobs().update(&job.id, update, now).await?;
    Ok(Json(JobResponse::new(job, now)))
}

async fn delete_job(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    auth.require(&[Permission::JobsDelete])?;
    let job = managed_job(&state, &auth, &id).await?;
    state.storage().jobs().soft_delete(&job.id, state.now()).await?;
    info!(stage = "jobs", job_id = %job.id, by = %auth.id(), "job deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn publish_job(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    auth.require(&[Permission::JobsPublish])?;
    let job = managed_job(&state, &auth, &id).await?;
    let now = state.now();

    if job.status == JobStatus::Published {
        return Err(ApiError::Conflict("job is already published".to_string()));
    }
    if job.deadline.is_some_and(|deadline| deadline <= now) {
        return Err(ApiError::validation("deadline has already passed"));
    }

    let (plan, _) = effective_plan(&state, &job.company_id, now).await?;
    let limits = PublishLimits {
        jobs: plan.job_post_limit,
        featured: plan.featured_job_limit,
    };
    let job = match state.storage().jobs().publish_within(&job.id, limits, now).await? {
        PublishOutcome::Published(job) => job,
        PublishOutcome::QuotaExceeded => return Err(quota_error(&state, &job, &plan).await?),
    };
    info!(
        stage = "jobs",
        job_id = %job.id,
        company_id = %job.company_id,
        plan = %plan.code,
        "job published"
    );
    Ok(Json(JobResponse::new(job, now)))
}

/// Names the plan limit that blocked a publish.
async fn quota_error(state: &AppState, job: &Job, plan: &Plan) -> ApiResult<ApiError> {
    let published = state.storage().jobs().count_published(&job.company_id).await?;
    if plan.allows_publish(published) {
        Ok(featured_quota(&plan.name, plan.featured_job_limit))
    } else {
        Ok(ApiError::QuotaExceeded(format!(
            "the {} plan allows {} published jobs",
            plan.name, plan.job_post_limit
        )))
    }
}

fn featured_quota(plan_name: &str, limit: i64) -> ApiError {
    ApiError::QuotaExceeded(format!("the {plan_name} plan allows {limit} featured jobs"))
}

async fn close_job(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = managed_job(&state, &auth, &id).await?;
    let now = state.now();
    let job = state.storage().jobs().close(&job.id, now).await?;
    info!(stage = "jobs", job_id = %job.id, "job closed");
    Ok(Json(JobResponse::new(job, now)))
}

async fn search_jobs(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<JobSearchQuery>,
) -> ApiResult<Json<Page<JobResponse>>> {
    let search = JobSearch {
        q: query.q,
        location: query.location,
        employment_type: query.employment_type,
        experience_level: query.experience_level,
        is_remote: query.is_remote,
        company_id: query.company_id,
        salary_min: query.salary_min,
        salary_max: query.salary_max,
        sort: query.sort.unwrap_or_default(),
    }
    .normalized();

    let now = state.now();
    let page = state
        .storage()
        .jobs()
        .search(&search, now, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page.map(|job| JobResponse::new(job, now))))
}

async fn show_job(
    State(state): State<AppState>,
    MaybeAuthUser(viewer): MaybeAuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let jobs = state.storage().jobs();
    let mut job = jobs.find(&id).await?.ok_or(ApiError::NotFound("job"))?;
    let now = state.now();
    let insider = viewer
        .as_ref()
        .is_some_and(|viewer| viewer.can_act_for(&job.company_id));

    if job.is_active(now) {
        if !insider {
            jobs.increment_views(&job.id).await?;
            job.views_count += 1;
        }
    } else if !insider {
        return Err(ApiError::NotFound("job"));
    }
    Ok(Json(JobResponse::new(job, now)))
}

async fn company_jobs(
    State(state): State<AppState>,
    MaybeAuthUser(viewer): MaybeAuthUser,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> ApiResult<Json<Page<JobResponse>>> {
    let company = load_company(&state, &id).await?;
    let include_all = viewer
        .as_ref()
        .is_some_and(|viewer| viewer.can_act_for(&company.id));

    let now = state.now();
    let page = state
        .storage()
        .jobs()
        .list_for_company(
            &company.id,
            include_all,
            now,
            PageRequest::new(query.page, query.limit),
        )
        .await?;
    Ok(Json(page.map(|job| JobResponse::new(job, now))))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Duration;
    use serde_json::json;

    use jobboard_core::access::Role;

    use crate::test_support::TestApp;

    fn job_body(title: &str) -> serde_json::Value {
        json!({
            "title": title,
            "description": "Work on the storage engine",
            "location": "Berlin",
            "employment_type": "full_time",
            "experience_level": "senior",
            "salary_min": 70000,
            "salary_max": 90000,
            "currency": "eur",
        })
    }

    #[tokio::test]
    async fn members_draft_jobs_for_their_company() {
        let app = TestApp::new().await;
        let (_, token, company) = app.employer("owner@example.com", "Acme").await;
        let (_, seeker) = app.user("seeker@example.com", Role::JobSeeker).await;

        let (status, body) = app.post("/jobs", Some(&token), job_body("Rust Engineer")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "draft");
        assert_eq!(body["company_id"], company.id.as_str());
        assert_eq!(body["currency"], "EUR");
        assert_eq!(body["salary_range"], "70000 - 90000 EUR");
        assert_eq!(body["is_active"], false);

        assert_eq!(
            app.post("/jobs", Some(&seeker), job_body("Nope")).await.0,
            StatusCode::FORBIDDEN
        );

        let mut inverted = job_body("Inverted");
        inverted["salary_min"] = json!(100000);
        assert_eq!(
            app.post("/jobs", Some(&token), inverted).await.0,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn updates_validate_the_merged_salary_band() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.draft_job(&company, &owner, "Rust Engineer").await;
        let uri = format!("/jobs/{}", job.id);

        let (status, _) = app
            .patch(&uri, Some(&token), json!({"salary_min": 90000}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .patch(&uri, Some(&token), json!({"title": "Staff Engineer", "is_remote": true}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Staff Engineer");
        assert_eq!(body["is_remote"], true);
        assert_eq!(body["location"], "Berlin");

        let (_, outsider, _) = app.employer("other@example.com", "Globex").await;
        assert_eq!(
            app.patch(&uri, Some(&outsider), json!({"title": "Hijack"})).await.0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(app.delete(&uri, Some(&token)).await.0, StatusCode::NO_CONTENT);
        assert_eq!(app.get(&uri, Some(&token)).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn free_plan_limits_publishing_to_one_job() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let first = app.draft_job(&company, &owner, "First").await;
        let second = app.draft_job(&company, &owner, "Second").await;

        let (status, body) = app
            .post(&format!("/jobs/{}/publish", first.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "published");
        assert!(body["published_at"].is_string());

        let (status, _) = app
            .post(&format!("/jobs/{}/publish", first.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app
            .post(&format!("/jobs/{}/publish", second.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["type"], "quota_exceeded");

        let (status, _) = app
            .post(&format!("/jobs/{}/close", first.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app
            .post(&format!("/jobs/{}/publish", second.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn featured_jobs_need_a_plan_that_allows_them() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.draft_job(&company, &owner, "Featured").await;
        app.patch(&format!("/jobs/{}", job.id), Some(&token), json!({"is_featured": true}))
            .await;

        let (status, body) = app
            .post(&format!("/jobs/{}/publish", job.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert!(body["detail"].as_str().unwrap().contains("featured"));
    }

    #[tokio::test]
    async fn featuring_a_published_job_respects_the_plan() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.published_job(&company, &owner, "Live").await;

        let (status, body) = app
            .patch(&format!("/jobs/{}", job.id), Some(&token), json!({"is_featured": true}))
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert!(body["detail"].as_str().unwrap().contains("featured"));
        assert_eq!(app.db().jobs().count_featured(&company.id).await.unwrap(), 0);

        let (status, _) = app
            .patch(&format!("/jobs/{}", job.id), Some(&token), json!({"title": "Still live"}))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn explicit_null_clears_optional_fields() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.draft_job(&company, &owner, "Rust Engineer").await;
        let uri = format!("/jobs/{}", job.id);
        let deadline = app.now() + Duration::days(30);

        let (status, body) = app
            .patch(&uri, Some(&token), json!({"deadline": deadline.to_rfc3339()}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["deadline"].is_string());
        assert_eq!(body["salary_max"], 80000);

        let (status, body) = app
            .patch(
                &uri,
                Some(&token),
                json!({"deadline": null, "salary_max": null, "requirements": null}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["deadline"].is_null());
        assert!(body["salary_max"].is_null());
        assert!(body["requirements"].is_null());
        assert_eq!(body["salary_min"], 60000);
    }

    #[tokio::test]
    async fn past_deadlines_block_publishing() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let job = app.draft_job(&company, &owner, "Late").await;
        let deadline = app.now() - Duration::days(1);
        app.patch(
            &format!("/jobs/{}", job.id),
            Some(&token),
            json!({"deadline": deadline.to_rfc3339()}),
        )
        .await;

        let (status, _) = app
            .post(&format!("/jobs/{}/publish", job.id), Some(&token), json!({}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn public_views_count_and_drafts_stay_private() {
        let app = TestApp::new().await;
        let (owner, token, company) = app.employer("owner@example.com", "Acme").await;
        let live = app.published_job(&company, &owner, "Live").await;
        let draft = app.draft_job(&company, &owner, "Draft").await;

        let (status, body) = app.get(&format!("/jobs/{}", live.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["views_count"], 1);
        assert_eq!(body["is_active"], true);

        let (_, body) = app.get(&format!("/jobs/{}", live.id), Some(&token)).await;
        assert_eq!(body["views_count"], 1);

        assert_eq!(
            app.get(&format!("/jobs/{}", draft.id), None).await.0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            app.get(&format!("/jobs/{}", draft.id), Some(&token)).await.0,
            StatusCode::OK
        );

        let (_, public) = app.get(&format!("/companies/{}/jobs", company.id), None).await;
        assert_eq!(public["total"], 1);
        let (_, internal) = app
            .get(&format!("/companies/{}/jobs", company.id), Some(&token))
            .await;
        assert_eq!(internal["total"], 2);
    }

    #[tokio::test]
    async fn search_filters_active_jobs() {
        let app = TestApp::new().await;
        let (owner, _, company) = app.employer("owner@example.com", "Acme").await;
        app.published_job(&company, &owner, "Rust Engineer").await;
        app.published_job(&company, &owner, "Go Engineer").await;
        app.draft_job(&company, &owner, "Go Draft").await;

        let (status, page) = app.get("/jobs?q=GO", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["title"], "Go Engineer");

        let (_, page) = app.get("/jobs?q=%20%20&limit=1", None).await;
        assert_eq!(page["total"], 2);
        assert_eq!(page["total_pages"], 2);

        let (_, page) = app.get("/jobs?salary_min=85000&sort=salary", None).await;
        assert_eq!(page["total"], 0);

        let (status, body) = app.get("/jobs?employment_type=freelance", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "validation_error");
    }
}
