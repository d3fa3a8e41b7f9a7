mod access;
mod applications;
mod billing;
mod blog;
mod companies;
mod cvs;
mod jobs;
mod messages;
mod notifications;
mod stats;
mod tokens;
mod uploads;
mod users;

use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

use jobboard_core::ParseEnumError;

pub use access::RolePermissionRepository;
pub use applications::{ApplicationRepository, ApplicationView, NewApplication};
pub use billing::{BillingRepository, NewPlan, PlanUpdate, SettlementOutcome};
pub use blog::{BlogRepository, NewPost, PostUpdate};
pub use companies::{CompanyRepository, CompanyUpdate, NewCompany};
pub use cvs::{CvRepository, CvUpdate, NewCv};
pub use jobs::{JobRepository, JobUpdate, NewJob, PublishLimits, PublishOutcome};
pub use messages::MessageRepository;
pub use notifications::{NewNotification, NotificationRepository};
pub use stats::{PlatformStats, StatsRepository};
pub use tokens::{NewToken, TokenRepository};
pub use uploads::{NewUpload, UploadRepository};
pub use users::{NewUser, ProfileUpdate, UserFilter, UserRepository};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(database_url, 5).await
    }

    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    pub fn tokens(&self) -> TokenRepository {
        TokenRepository::new(self.pool.clone())
    }

    pub fn role_permissions(&self) -> RolePermissionRepository {
        RolePermissionRepository::new(self.pool.clone())
    }

    pub fn companies(&self) -> CompanyRepository {
        CompanyRepository::new(self.pool.clone())
    }

    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }

    pub fn applications(&self) -> ApplicationRepository {
        ApplicationRepository::new(self.pool.clone())
    }

    pub fn cvs(&self) -> CvRepository {
        CvRepository::new(self.pool.clone())
    }

    pub fn uploads(&self) -> UploadRepository {
        UploadRepository::new(self.pool.clone())
    }

    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    pub fn messages(&self) -> MessageRepository {
        MessageRepository::new(self.pool.clone())
    }

    pub fn blog(&self) -> BlogRepository {
        BlogRepository::new(self.pool.clone())
    }

    pub fn billing(&self) -> BillingRepository {
        BillingRepository::new(self.pool.clone())
    }

    pub fn stats(&self) -> StatsRepository {
        StatsRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Error shared by every repository.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,
    #[error("conflicting record: {0}")]
    Conflict(&'static str),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            other => Self::Database(other),
        }
    }
}

impl From<ParseEnumError> for RepoError {
    fn from(err: ParseEnumError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Maps SQLite unique/primary-key violations to [`RepoError::Conflict`].
pub(crate) fn conflict_on_unique(err: sqlx::Error, what: &'static str) -> RepoError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code();
            if code == Some(Cow::Borrowed("2067")) || code == Some(Cow::Borrowed("1555")) {
                RepoError::Conflict(what)
            } else {
                RepoError::Database(sqlx::Error::Database(db_err))
            }
        }
        other => other.into(),
    }
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(to_rfc3339)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};
    use jobboard_core::access::Role;

    use super::*;

    pub fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    pub async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    pub async fn insert_user(db: &Database, email: &str, role: Role) -> String {
        let user = db
            .users()
            .insert(NewUser {
                email: email.to_string(),
                password_hash: "hash".to_string(),
                full_name: email.split('@').next().unwrap_or("user").to_string(),
                role,
                created_at: ts("2024-01-01T00:00:00Z"),
            })
            .await
            .expect("insert user");
        user.id
    }

    /// Creates an employer together with a company and returns `(user_id, company_id)`.
    pub async fn insert_company(db: &Database, email: &str, name: &str) -> (String, String) {
        let owner = insert_user(db, email, Role::Employer).await;
        let company = db
            .companies()
            .create(NewCompany {
                owner_id: owner.clone(),
                name: name.to_string(),
                description: None,
                website: None,
                industry: Some("software".to_string()),
                size: None,
                location: Some("Berlin".to_string()),
                logo_url: None,
                created_at: ts("2024-01-01T00:00:00Z"),
            })
            .await
            .expect("insert company");
        (owner, company.id)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 15, "expected core tables to be created");

        let plans: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plans")
            .fetch_one(db.pool())
            .await
            .expect("count plans");
        assert_eq!(plans.0, 3);
    }
}
