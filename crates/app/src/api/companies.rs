use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use jobboard_core::access::{Permission, Role};
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Company, User};
use jobboard_storage::{CompanyUpdate, NewCompany};

use super::{load_company, non_blank, ApiQuery, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/companies", post(create_company).get(list_companies))
        .route(
            "/companies/:id",
            get(show_company).patch(update_company).delete(delete_company),
        )
        .route("/companies/:id/members", get(list_members).post(add_member))
        .route("/companies/:id/members/:user_id", delete(remove_member))
        .route("/admin/companies/:id/verify", patch(verify_company))
}

#[derive(Debug, Deserialize, Validate)]
struct CompanyRequest {
    #[validate(length(min = 1, max = 200))]
    name: String,
    #[validate(length(max = 5000))]
    description: Option<String>,
    #[validate(url)]
    website: Option<String>,
    #[validate(length(max = 100))]
    industry: Option<String>,
    #[validate(length(max = 50))]
    size: Option<String>,
    #[validate(length(max = 200))]
    location: Option<String>,
    #[validate(url)]
    logo_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct CompanyPatch {
    #[validate(length(min = 1, max = 200))]
    name: Option<String>,
    #[validate(length(max = 5000))]
    description: Option<String>,
    #[validate(url)]
    website: Option<String>,
    #[validate(length(max = 100))]
    industry: Option<String>,
    #[validate(length(max = 50))]
    size: Option<String>,
    #[validate(length(max = 200))]
    location: Option<String>,
    #[validate(url)]
    logo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompanyListQuery {
    q: Option<String>,
    industry: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
struct MemberRequest {
    user_id: String,
}

#[derive(Debug, Deserialize, Validate)]
struct VerifyRequest {
    is_verified: bool,
}

async fn create_company(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<CompanyRequest>,
) -> ApiResult<(StatusCode, Json<Company>)> {
    auth.require(&[Permission::CompaniesCreate])?;
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::validation("name must not be blank"));
    }

    let company = state
        .storage()
        .companies()
        .create(NewCompany {
            owner_id: auth.id().to_string(),
            name,
            description: non_blank(body.description),
            website: non_blank(body.website),
            industry: non_blank(body.industry),
            size: non_blank(body.size),
            location: non_blank(body.location),
            logo_url: non_blank(body.logo_url),
            created_at: state.now(),
        })
        .await?;
    info!(
        stage = "app",
        company_id = %company.id,
        slug = %company.slug,
        owner = %auth.id(),
        "company created"
    );
    Ok((StatusCode::CREATED, Json(company)))
}

async fn list_companies(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CompanyListQuery>,
) -> ApiResult<Json<Page<Company>>> {
    let q = non_blank(query.q);
    let industry = non_blank(query.industry);
    let page = state
        .storage()
        .companies()
        .list(
            q.as_deref(),
            industry.as_deref(),
            PageRequest::new(query.page, query.limit),
        )
        .await?;
    Ok(Json(page))
}

async fn show_company(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Company>> {
    Ok(Json(load_company(&state, &id).await?))
}

async fn update_company(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<CompanyPatch>,
) -> ApiResult<Json<Company>> {
    auth.require(&[Permission::CompaniesUpdate])?;
    let company = load_company(&state, &id).await?;
    if !auth.can_act_for(&company.id) {
        return Err(ApiError::forbidden("you are not a member of this company"));
    }

    let update = CompanyUpdate {
        name: non_blank(body.name),
        description: non_blank(body.description),
        website: non_blank(body.website),
        industry: non_blank(body.industry),
        size: non_blank(body.size),
        location: non_blank(body.location),
        logo_url: non_blank(body.logo_url),
    };
    let company = state
        .storage()
        .companies()
        .update(&company.id, update, state.now())
        .await?;
    Ok(Json(company))
}

async fn delete_company(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    auth.require(&[Permission::CompaniesDelete])?;
    let company = load_company(&state, &id).await?;
    if !auth.is_admin() && company.owner_id != auth.user.id {
        return Err(ApiError::forbidden("only the company owner can delete it"));
    }

    let closed_jobs = state
        .storage()
        .companies()
        .soft_delete(&company.id, state.now())
        .await?;
    info!(stage = "app", company_id = %company.id, closed_jobs, by = %auth.id(), "company deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<User>>> {
    let company = load_company(&state, &id).await?;
    if !auth.can_act_for(&company.id) {
        return Err(ApiError::forbidden("you are not a member of this company"));
    }

    let users = state.storage().users();
    let mut members = Vec::new();
    for member_id in state.storage().companies().member_ids(&company.id).await? {
        if let Some(user) = users.find_by_id(&member_id).await? {
            members.push(user);
        }
    }
    Ok(Json(members))
}

async fn add_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<MemberRequest>,
) -> ApiResult<StatusCode> {
    let company = load_company(&state, &id).await?;
    if company.owner_id != auth.user.id {
        return Err(ApiError::forbidden("only the company owner can add members"));
    }

    let target = state
        .storage()
        .users()
        .find_by_id(&body.user_id)
        .await?
        .filter(User::can_sign_in)
        .ok_or(ApiError::NotFound("user"))?;
    if target.role != Role::Hr {
        return Err(ApiError::validation("only hr users can join a company"));
    }

    state
        .storage()
        .companies()
        .add_member(&company.id, &target.id, state.now())
        .await?;
    info!(stage = "app", company_id = %company.id, user_id = %target.id, "member added");
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let company = load_company(&state, &id).await?;
    if company.owner_id != auth.user.id {
        return Err(ApiError::forbidden("only the company owner can remove members"));
    }
    if user_id == company.owner_id {
        return Err(ApiError::validation("the owner cannot be removed"));
    }

    state
        .storage()
        .companies()
        .remove_member(&company.id, &user_id, state.now())
        .await
        .map_err(ApiError::missing("member"))?;
    info!(stage = "app", company_id = %company.id, %user_id, "member removed");
    Ok(StatusCode::NO_CONTENT)
}

async fn verify_company(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<VerifyRequest>,
) -> ApiResult<Json<Company>> {
    auth.require(&[Permission::CompaniesVerify])?;
    let company = state
        .storage()
        .companies()
        .set_verified(&id, body.is_verified, state.now())
        .await
        .map_err(ApiError::missing("company"))?;
    Ok(Json(company))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use jobboard_core::access::Role;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn employers_create_one_company_with_unique_slugs() {
        let app = TestApp::new().await;
        let (_, first) = app.user("one@example.com", Role::Employer).await;
        let (_, second) = app.user("two@example.com", Role::Employer).await;

        let (status, body) = app
            .post("/companies", Some(&first), json!({"name": "Acme Corp"}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["slug"], "acme-corp");
        assert_eq!(body["is_verified"], false);

        let (status, _) = app
            .post("/companies", Some(&first), json!({"name": "Another"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app
            .post("/companies", Some(&second), json!({"name": "Acme  Corp!"}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["slug"], "acme-corp-2");

        let (status, page) = app.get("/companies?q=acme", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 2);
    }

    #[tokio::test]
    async fn job_seekers_cannot_create_companies() {
        let app = TestApp::new().await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (status, _) = app
            .post("/companies", Some(&token), json!({"name": "Acme"}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn only_members_update_and_only_owners_delete() {
        let app = TestApp::new().await;
        let (_, owner, company) = app.employer("owner@example.com", "Acme").await;
        let (_, outsider, _) = app.employer("other@example.com", "Globex").await;
        let uri = format!("/companies/{}", company.id);

        let (status, _) = app
            .patch(&uri, Some(&outsider), json!({"location": "Paris"}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .patch(&uri, Some(&owner), json!({"location": "Paris"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["location"], "Paris");
        assert_eq!(body["industry"], "software");

        assert_eq!(app.delete(&uri, Some(&outsider)).await.0, StatusCode::FORBIDDEN);
        assert_eq!(app.delete(&uri, Some(&owner)).await.0, StatusCode::NO_CONTENT);
        assert_eq!(app.get(&uri, None).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn owners_manage_hr_members() {
        let app = TestApp::new().await;
        let (owner, owner_token, company) = app.employer("owner@example.com", "Acme").await;
        let (hr, hr_token) = app.user("hr@example.com", Role::Hr).await;
        let (seeker, _) = app.user("seeker@example.com", Role::JobSeeker).await;
        let members = format!("/companies/{}/members", company.id);

        let (status, _) = app
            .post(&members, Some(&hr_token), json!({"user_id": hr.id}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .post(&members, Some(&owner_token), json!({"user_id": seeker.id}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .post(&members, Some(&owner_token), json!({"user_id": hr.id}))
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app
            .post(&members, Some(&owner_token), json!({"user_id": hr.id}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, list) = app.get(&members, Some(&owner_token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().map(Vec::len), Some(2));

        let (status, _) = app
            .delete(&format!("{members}/{}", owner.id), Some(&owner_token))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app
            .delete(&format!("{members}/{}", hr.id), Some(&owner_token))
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app
            .delete(&format!("{members}/{}", hr.id), Some(&owner_token))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admins_verify_companies() {
        let app = TestApp::new().await;
        let (_, owner, company) = app.employer("owner@example.com", "Acme").await;
        let (_, admin) = app.admin().await;
        let uri = format!("/admin/companies/{}/verify", company.id);

        assert_eq!(
            app.patch(&uri, Some(&owner), json!({"is_verified": true})).await.0,
            StatusCode::FORBIDDEN
        );
        let (status, body) = app.patch(&uri, Some(&admin), json!({"is_verified": true})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_verified"], true);
    }
}
