//! HTTP handlers, one module per resource.

mod admin;
mod applications;
mod auth;
mod blog;
mod companies;
mod cvs;
mod jobs;
mod messages;
mod notifications;
mod subscriptions;
mod uploads;
mod users;

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use validator::{Validate, ValidationError};

use jobboard_core::types::Company;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(auth::routes())
        .merge(users::routes())
        .merge(companies::routes())
        .merge(jobs::routes())
        .merge(applications::routes())
        .merge(cvs::routes())
        .merge(uploads::routes())
        .merge(notifications::routes())
        .merge(messages::routes())
        .merge(blog::routes())
        .merge(subscriptions::routes())
        .merge(admin::routes())
}

/// JSON body that has passed its `validator` rules.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// `Query` with problem+json rejections.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

pub(crate) fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

pub(crate) fn email_address(value: &str) -> Result<(), ValidationError> {
    if validator::validate_email(value.trim()) {
        Ok(())
    } else {
        Err(ValidationError::new("email"))
    }
}

/// Keeps an explicit `null` apart from an absent field: absent stays `None`
/// through `#[serde(default)]`, `null` becomes `Some(None)`.
pub(crate) fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Trimmed text, or `None` when nothing is left.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

pub(crate) async fn load_company(state: &AppState, id: &str) -> ApiResult<Company> {
    state
        .storage()
        .companies()
        .find(id)
        .await?
        .ok_or(ApiError::NotFound("company"))
}

/// The caller's own company. Only its owner passes.
pub(crate) async fn owned_company(state: &AppState, auth: &AuthUser) -> ApiResult<Company> {
    let company = member_company(state, auth).await?;
    if company.owner_id != auth.user.id {
        return Err(ApiError::forbidden("only the company owner can do this"));
    }
    Ok(company)
}

pub(crate) async fn member_company(state: &AppState, auth: &AuthUser) -> ApiResult<Company> {
    let company_id = auth
        .user
        .company_id
        .as_deref()
        .ok_or_else(|| ApiError::validation("you do not belong to a company"))?;
    load_company(state, company_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_checks_ignore_surrounding_whitespace() {
        assert!(email_address(" Ada@Example.com ").is_ok());
        assert!(email_address("not-an-email").is_err());
        assert_eq!(normalize_email(" Ada@Example.com "), "ada@example.com");
    }

    #[test]
    fn blank_text_becomes_none() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some(" Rust ".into())).as_deref(), Some("Rust"));
        assert_eq!(non_blank(None), None);
    }
}
