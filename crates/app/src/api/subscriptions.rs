use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use jobboard_core::access::Permission;
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Payment, Plan, Subscription, SubscriptionStatus, FREE_PLAN_CODE};
use jobboard_storage::{NewPlan, PlanUpdate};

use super::{member_company, non_blank, owned_company, ApiQuery, ValidJson};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/plans", get(list_plans))
        .route("/admin/plans", post(create_plan))
        .route("/admin/plans/:id", patch(update_plan))
        .route("/subscriptions", post(subscribe))
        .route("/subscriptions/current", get(current))
        .route("/subscriptions/current/cancel", post(cancel))
        .route("/subscriptions/payments", get(payments))
        .route("/admin/subscriptions", get(list_subscriptions))
}

/// The plan that governs a company's quotas at `now`: its active
/// subscription's plan, or the free plan.
pub(crate) async fn effective_plan(
    state: &AppState,
    company_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<(Plan, Option<Subscription>)> {
    let billing = state.storage().billing();
    if let Some((subscription, plan)) = billing.current_subscription(company_id, now).await? {
        return Ok((plan, Some(subscription)));
    }
    let free = billing
        .find_plan_by_code(FREE_PLAN_CODE)
        .await?
        .ok_or_else(|| ApiError::internal("free plan is not configured"))?;
    Ok((free, None))
}

#[derive(Debug, Deserialize, Validate)]
struct CreatePlanRequest {
    #[validate(length(min = 1, max = 40))]
    code: String,
    #[validate(length(min = 1, max = 100))]
    name: String,
    #[validate(range(min = 0))]
    price_cents: i64,
    #[validate(length(equal = 3))]
    currency: String,
    #[validate(range(min = 1, max = 3650))]
    duration_days: i64,
    #[validate(range(min = 0))]
    job_post_limit: i64,
    #[validate(range(min = 0))]
    featured_job_limit: i64,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdatePlanRequest {
    #[validate(length(min = 1, max = 100))]
    name: Option<String>,
    #[validate(range(min = 0))]
    price_cents: Option<i64>,
    #[validate(range(min = 1, max = 3650))]
    duration_days: Option<i64>,
    #[validate(range(min = 0))]
    job_post_limit: Option<i64>,
    #[validate(range(min = 0))]
    featured_job_limit: Option<i64>,
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
struct SubscribeRequest {
    #[validate(length(min = 1))]
    plan_code: String,
}

#[derive(Debug, Serialize)]
struct CheckoutResponse {
    subscription: Subscription,
    payment: Payment,
    reference: String,
}

#[derive(Debug, Serialize)]
struct CurrentPlanResponse {
    plan: Plan,
    subscription: Option<Subscription>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionListQuery {
    status: Option<SubscriptionStatus>,
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.storage().billing().list_plans(true).await?))
}

async fn create_plan(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<CreatePlanRequest>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    auth.require(&[Permission::PlansManage])?;
    let plan = state
        .storage()
        .billing()
        .insert_plan(NewPlan {
            code: body.code.trim().to_lowercase(),
            name: body.name.trim().to_string(),
            price_cents: body.price_cents,
            currency: body.currency.to_uppercase(),
            duration_days: body.duration_days,
            job_post_limit: body.job_post_limit,
            featured_job_limit: body.featured_job_limit,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "payments", plan = %plan.code, by = %auth.id(), "plan created");
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn update_plan(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    ValidJson(body): ValidJson<UpdatePlanRequest>,
) -> ApiResult<Json<Plan>> {
    auth.require(&[Permission::PlansManage])?;
    let update = PlanUpdate {
        name: non_blank(body.name),
        price_cents: body.price_cents,
        duration_days: body.duration_days,
        job_post_limit: body.job_post_limit,
        featured_job_limit: body.featured_job_limit,
        is_active: body.is_active,
    };
    let plan = state
        .storage()
        .billing()
        .update_plan(&id, update, state.now())
        .await
        .map_err(ApiError::missing("plan"))?;
    Ok(Json(plan))
}

async fn subscribe(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidJson(body): ValidJson<SubscribeRequest>,
) -> ApiResult<Response> {
    auth.require(&[Permission::SubscriptionsManage])?;
    let company = owned_company(&state, &auth).await?;
    let billing = state.storage().billing();
    let plan = billing
        .find_plan_by_code(body.plan_code.trim())
        .await?
        .filter(|plan| plan.is_active)
        .ok_or(ApiError::NotFound("plan"))?;
    let now = state.now();

    if plan.is_free() {
        let subscription = billing.activate_free(&company.id, &plan, now).await?;
        info!(
            stage = "payments",
            company_id = %company.id,
            plan = %plan.code,
            "free plan activated"
        );
        return Ok((StatusCode::CREATED, Json(subscription)).into_response());
    }

    let reference = format!("pay_{}", Uuid::new_v4().simple());
    let (subscription, payment) = billing
        .create_pending(&company.id, &plan, &reference, now)
        .await?;
    info!(
        stage = "payments",
        company_id = %company.id,
        plan = %plan.code,
        reference = %reference,
        amount_cents = payment.amount_cents,
        "checkout started"
    );
    let checkout = CheckoutResponse {
        subscription,
        payment,
        reference,
    };
    Ok((StatusCode::ACCEPTED, Json(checkout)).into_response())
}

async fn current(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<CurrentPlanResponse>> {
    let company = member_company(&state, &auth).await?;
    let (plan, subscription) = effective_plan(&state, &company.id, state.now()).await?;
    Ok(Json(CurrentPlanResponse { plan, subscription }))
}

async fn cancel(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Subscription>> {
    auth.require(&[Permission::SubscriptionsManage])?;
    let company = owned_company(&state, &auth).await?;
    let subscription = state
        .storage()
        .billing()
        .cancel_active(&company.id, state.now())
        .await
        .map_err(ApiError::missing("active subscription"))?;
    info!(
        stage = "payments",
        company_id = %company.id,
        subscription_id = %subscription.id,
        "subscription cancelled"
    );
    Ok(Json(subscription))
}

async fn payments(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> ApiResult<Json<Page<Payment>>> {
    auth.require(&[Permission::SubscriptionsManage])?;
    let company = member_company(&state, &auth).await?;
    let page = state
        .storage()
        .billing()
        .list_payments(&company.id, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<SubscriptionListQuery>,
) -> ApiResult<Json<Page<Subscription>>> {
    auth.require(&[Permission::PlansManage])?;
    let page = state
        .storage()
        .billing()
        .list_subscriptions(query.status, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}
