use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{new_id, to_rfc3339, RepoError};

/// Refresh and password-reset tokens. Only SHA-256 hashes are stored.
#[derive(Clone)]
pub struct TokenRepository {
    pool: SqlitePool,
}

pub struct NewToken<'a> {
    pub user_id: &'a str,
    pub token_hash: &'a str,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TokenRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_refresh(&self, token: NewToken<'_>) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(token.user_id)
        .bind(token.token_hash)
        .bind(to_rfc3339(token.expires_at))
        .bind(to_rfc3339(token.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Revokes a live refresh token and returns its owner.
    ///
    /// Returns `None` when the token is unknown, expired or already revoked, so a
    /// token can only ever be exchanged once.
    pub async fn consume_refresh(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepoError> {
        let now = to_rfc3339(now);
        let user_id = sqlx::query_scalar(
            "UPDATE refresh_tokens SET revoked_at = ? \
             WHERE token_hash = ? AND revoked_at IS NULL AND expires_at > ? \
             RETURNING user_id",
        )
        .bind(&now)
        .bind(token_hash)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    pub async fn revoke_refresh(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
        )
        .bind(to_rfc3339(now))
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
        )
        .bind(to_rfc3339(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_reset(&self, token: NewToken<'_>) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO password_resets (id, user_id, token_hash, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(token.user_id)
        .bind(token.token_hash)
        .bind(to_rfc3339(token.expires_at))
        .bind(to_rfc3339(token.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a reset token as used and returns its owner; single use.
    pub async fn consume_reset(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepoError> {
        let now = to_rfc3339(now);
        let user_id = sqlx::query_scalar(
            "UPDATE password_resets SET used_at = ? \
             WHERE token_hash = ? AND used_at IS NULL AND expires_at > ? \
             RETURNING user_id",
        )
        .bind(&now)
        .bind(token_hash)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    /// Deletes refresh and reset tokens that can no longer be used.
    pub async fn purge_stale(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let now = to_rfc3339(now);
        let refresh = sqlx::query(
            "DELETE FROM refresh_tokens WHERE revoked_at IS NOT NULL OR expires_at <= ?",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let resets = sqlx::query(
            "DELETE FROM password_resets WHERE used_at IS NOT NULL OR expires_at <= ?",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(refresh.rows_affected() + resets.rows_affected())
    }
}
