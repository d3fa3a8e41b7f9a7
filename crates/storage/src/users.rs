use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use jobboard_core::access::Role;
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::search::like_pattern;
use jobboard_core::types::User;

use crate::{conflict_on_unique, new_id, to_rfc3339, to_u64, RepoError};

const USER_COLUMNS: &str = "id, email, password_hash, full_name, phone, avatar_url, role, \
     company_id, is_active, last_login_at, created_at, updated_at, deleted_at";

/// Repository for accounts and credentials.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub q: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    password_hash: String,
    full_name: String,
    phone: Option<String>,
    avatar_url: Option<String>,
    role: String,
    company_id: Option<String>,
    is_active: bool,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_domain(self) -> Result<(User, String), RepoError> {
        let user = User {
            id: self.id,
            email: self.email,
            full_name: self.full_name,
            phone: self.phone,
            avatar_url: self.avatar_url,
            role: self.role.parse()?,
            company_id: self.company_id,
            is_active: self.is_active,
            last_login_at: self.last_login_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        };
        Ok((user, self.password_hash))
    }
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new account. Emails are unique across live and deleted rows.
    pub async fn insert(&self, record: NewUser) -> Result<User, RepoError> {
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, full_name, role, is_active, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(&record.email)
        .bind(&record.password_hash)
        .bind(&record.full_name)
        .bind(record.role.as_str())
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_on_unique(err, "email already registered"))?;

        self.find_by_id(&id).await?.ok_or(RepoError::NotFound)
    }

    /// Loads a user including soft-deleted rows.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.into_domain().map(|(user, _)| user))
            .transpose()
    }

    /// Returns the live user and its password hash for credential checks.
    pub async fn find_credentials(&self, email: &str) -> Result<Option<(User, String)>, RepoError> {
        let sql =
            format!("SELECT {USER_COLUMNS} FROM users WHERE email = ? AND deleted_at IS NULL");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(UserRow::into_domain).transpose()
    }

    pub async fn password_hash(&self, id: &str) -> Result<String, RepoError> {
        let hash: Option<String> = sqlx::query_scalar(
            "SELECT password_hash FROM users WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        hash.ok_or(RepoError::NotFound)
    }

    pub async fn update_password(
        &self,
        id: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(password_hash)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    pub async fn record_login(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
            .bind(to_rfc3339(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_profile(
        &self,
        id: &str,
        update: ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<User, RepoError> {
        let result = sqlx::query(
            "UPDATE users SET full_name = COALESCE(?, full_name), phone = COALESCE(?, phone), \
             avatar_url = COALESCE(?, avatar_url), updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(update.full_name)
        .bind(update.phone)
        .bind(update.avatar_url)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find_by_id(id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn set_role(
        &self,
        id: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<User, RepoError> {
        let result = sqlx::query(
            "UPDATE users SET role = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(role.as_str())
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find_by_id(id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn set_active(
        &self,
        id: &str,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<User, RepoError> {
        let result = sqlx::query(
            "UPDATE users SET is_active = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(is_active)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find_by_id(id).await?.ok_or(RepoError::NotFound)
    }

    /// Links or unlinks the user to a company.
    pub async fn set_company(
        &self,
        id: &str,
        company_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE users SET company_id = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(company_id)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    pub async fn soft_delete(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE users SET deleted_at = ?, is_active = 0, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    pub async fn list(
        &self,
        filter: &UserFilter,
        page: PageRequest,
    ) -> Result<Page<User>, RepoError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users");
        push_user_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {USER_COLUMNS} FROM users"));
        push_user_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(i64::from(page.limit()))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select
            .build_query_as::<UserRow>()
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(|row| row.into_domain().map(|(user, _)| user))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    /// Ids of every active user, optionally restricted to one role.
    pub async fn active_ids(&self, role: Option<Role>) -> Result<Vec<String>, RepoError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM users WHERE deleted_at IS NULL AND is_active = 1 \
             AND (? IS NULL OR role = ?) ORDER BY created_at",
        )
        .bind(role.map(Role::as_str))
        .bind(role.map(Role::as_str))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn push_user_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &UserFilter) {
    builder.push(" WHERE deleted_at IS NULL");
    if let Some(role) = filter.role {
        builder.push(" AND role = ").push_bind(role.as_str());
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let pattern = like_pattern(&q.to_lowercase());
        builder
            .push(" AND (LOWER(email) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(full_name) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

pub(crate) fn expect_one(rows_affected: u64) -> Result<(), RepoError> {
    if rows_affected == 0 {
        Err(RepoError::NotFound)
    } else {
        Ok(())
    }
}
