use std::{collections::HashMap, sync::Arc};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use jobboard_core::access::{Permission, PermissionSet, Role};
use jobboard_core::types::User;
use jobboard_storage::{Database, NewUser, RepoError};
use jobboard_util::{AdminBootstrap, PasswordHashConfig};

use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

const OPAQUE_TOKEN_BYTES: usize = 32;

/// Claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies HS256 access tokens.
///
/// Expiry is checked against the caller supplied clock instead of the
/// wall clock so tests can move time.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8], access_ttl: std::time::Duration) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl: Duration::from_std(access_ttl).unwrap_or_else(|_| Duration::hours(1)),
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    pub fn issue(&self, user: &User, now: DateTime<Utc>) -> ApiResult<String> {
        let claims = Claims {
            sub: user.id.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(ApiError::internal)
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(err.to_string()))?;
        if now.timestamp() >= data.claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(data.claims)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
}

impl TokenError {
    fn reason(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_token",
            Self::Expired => "expired_token",
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid password hashing parameters: {0}")]
pub struct HasherConfigError(String);

/// Argon2id password hashing. Hashing runs on the blocking pool.
#[derive(Clone)]
pub struct Passwords {
    params: Params,
}

impl Passwords {
    pub fn new(config: PasswordHashConfig) -> Result<Self, HasherConfigError> {
        let params = Params::new(config.memory_kib, config.iterations, 1, None)
            .map_err(|err| HasherConfigError(err.to_string()))?;
        Ok(Self { params })
    }

    pub async fn hash(&self, password: &str) -> ApiResult<String> {
        let params = self.params.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let mut salt = [0u8; 16];
            OsRng.fill_bytes(&mut salt);
            let salt = SaltString::encode_b64(&salt).map_err(ApiError::internal)?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    /// Checks `password` against a stored PHC string. Parameters come from
    /// the hash itself.
    pub async fn verify(&self, password: &str, stored: &str) -> ApiResult<bool> {
        let password = password.to_string();
        let stored = stored.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&stored).map_err(ApiError::internal)?;
            Ok(Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok())
        })
        .await
        .map_err(ApiError::internal)?
    }
}

/// Random URL-safe token handed to clients for refresh and reset flows.
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Storage form of an opaque token.
pub fn hash_opaque_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// In-memory cache of the `role_permissions` table.
#[derive(Clone, Default)]
pub struct PermissionRegistry {
    roles: Arc<RwLock<HashMap<Role, PermissionSet>>>,
}

impl PermissionRegistry {
    /// Seeds the table on first start and loads it.
    pub async fn load(database: &Database) -> Result<Self, RepoError> {
        let repo = database.role_permissions();
        if repo.seed_defaults_if_empty().await? {
            info!(stage = "auth", "seeded default role permissions");
        }
        let roles = repo.load_all().await?;
        Ok(Self {
            roles: Arc::new(RwLock::new(roles)),
        })
    }

    pub async fn permissions(&self, role: Role) -> PermissionSet {
        self.roles
            .read()
            .await
            .get(&role)
            .cloned()
            .unwrap_or_default()
    }

    /// Persists a new permission list for `role` and swaps it into the cache.
    pub async fn replace(
        &self,
        database: &Database,
        role: Role,
        permissions: PermissionSet,
    ) -> Result<(), RepoError> {
        database.role_permissions().replace(role, &permissions).await?;
        self.roles.write().await.insert(role, permissions);
        Ok(())
    }
}

/// Authenticated caller with the permissions of its current role.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub permissions: PermissionSet,
}

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn is_admin(&self) -> bool {
        self.user.role == Role::Admin
    }

    /// Fails with 403 unless every permission in `required` is granted.
    pub fn require(&self, required: &[Permission]) -> ApiResult<()> {
        if self.permissions.allows(required) {
            return Ok(());
        }
        let missing = self
            .permissions
            .missing(required)
            .into_iter()
            .map(Permission::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Err(ApiError::forbidden(format!("missing permission: {missing}")))
    }

    /// Member of the company, or an administrator.
    pub fn can_act_for(&self, company_id: &str) -> bool {
        self.is_admin() || self.user.belongs_to(company_id)
    }
}

/// Resolves a raw access token to a live user.
pub async fn authenticate(state: &AppState, token: &str) -> ApiResult<AuthUser> {
    let claims = state.tokens().verify(token, state.now()).map_err(|err| {
        counter!("http_auth_failures_total", "reason" => err.reason()).increment(1);
        ApiError::Unauthorized("invalid or expired access token")
    })?;

    let user = state
        .storage()
        .users()
        .find_by_id(&claims.sub)
        .await?
        .filter(User::can_sign_in)
        .ok_or_else(|| {
            counter!("http_auth_failures_total", "reason" => "inactive_user").increment(1);
            ApiError::Unauthorized("account is not active")
        })?;

    let permissions = state.permissions().permissions(user.role).await;
    Ok(AuthUser { user, permissions })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            counter!("http_auth_failures_total", "reason" => "missing_token").increment(1);
            return Err(ApiError::Unauthorized("missing bearer token"));
        };
        authenticate(state, token).await
    }
}

/// Like [`AuthUser`] for public endpoints that show more to signed-in callers.
/// A malformed token is still rejected.
pub struct MaybeAuthUser(pub Option<AuthUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeAuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match bearer_token(&parts.headers) {
            Some(token) => Ok(Self(Some(authenticate(state, token).await?))),
            None => Ok(Self(None)),
        }
    }
}

/// Creates the bootstrap administrator unless the email is already taken.
pub async fn ensure_admin(state: &AppState, admin: &AdminBootstrap) -> ApiResult<()> {
    let email = admin.email.trim().to_lowercase();
    if state.storage().users().find_credentials(&email).await?.is_some() {
        return Ok(());
    }

    let password_hash = state.passwords().hash(&admin.password).await?;
    let result = state
        .storage()
        .users()
        .insert(NewUser {
            email: email.clone(),
            password_hash,
            full_name: "Administrator".to_string(),
            role: Role::Admin,
            created_at: state.now(),
        })
        .await;

    match result {
        Ok(user) => {
            info!(stage = "auth", user_id = %user.id, %email, "bootstrap administrator created");
            Ok(())
        }
        Err(RepoError::Conflict(_)) => {
            warn!(stage = "auth", %email, "bootstrap email belongs to a deleted account");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobboard_core::access::default_permissions;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
    }

    fn user(role: Role) -> User {
        let now = ts("2024-01-01T00:00:00Z");
        User {
            id: "u-1".into(),
            email: "a@example.com".into(),
            full_name: "Ada".into(),
            phone: None,
            avatar_url: None,
            role,
            company_id: Some("c-1".into()),
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn access_tokens_expire_against_the_given_clock() {
        let service = TokenService::new(b"secret", std::time::Duration::from_secs(60));
        let issued_at = ts("2024-01-01T00:00:00Z");
        let token = service.issue(&user(Role::Hr), issued_at).unwrap();

        let claims = service.verify(&token, ts("2024-01-01T00:00:59Z")).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.role, Role::Hr);
        assert!(matches!(
            service.verify(&token, ts("2024-01-01T00:01:00Z")),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn tokens_signed_with_another_key_are_rejected() {
        let issuer = TokenService::new(b"one", std::time::Duration::from_secs(60));
        let verifier = TokenService::new(b"two", std::time::Duration::from_secs(60));
        let now = ts("2024-01-01T00:00:00Z");
        let token = issuer.issue(&user(Role::Admin), now).unwrap();
        assert!(matches!(verifier.verify(&token, now), Err(TokenError::Invalid(_))));
        assert!(matches!(verifier.verify("garbage", now), Err(TokenError::Invalid(_))));
    }

    #[tokio::test]
    async fn password_hashes_verify() {
        let passwords = Passwords::new(PasswordHashConfig {
            memory_kib: 1024,
            iterations: 1,
        })
        .unwrap();
        let hash = passwords.hash("correct horse").await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(passwords.verify("correct horse", &hash).await.unwrap());
        assert!(!passwords.verify("battery staple", &hash).await.unwrap());
    }

    #[test]
    fn opaque_tokens_are_random_and_hashed() {
        let first = generate_opaque_token();
        let second = generate_opaque_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert_eq!(hash_opaque_token(&first).len(), 64);
        assert_eq!(hash_opaque_token(&first), hash_opaque_token(&first));
    }

    #[test]
    fn guard_requires_every_permission() {
        let auth = AuthUser {
            user: user(Role::Hr),
            permissions: default_permissions(Role::Hr),
        };
        assert!(auth.require(&[Permission::JobsCreate]).is_ok());
        let err = auth
            .require(&[Permission::JobsCreate, Permission::JobsDelete])
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(ref msg) if msg.contains("jobs:delete")));
        assert!(auth.can_act_for("c-1"));
        assert!(!auth.can_act_for("c-2"));
    }
}
