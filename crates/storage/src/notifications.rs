use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Notification, NotificationKind};

use crate::users::expect_one;
use crate::{new_id, to_rfc3339, to_u64, RepoError};

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, title, body, data_json, is_read, created_at, read_at";

#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: String,
    user_id: String,
    kind: String,
    title: String,
    body: String,
    data_json: String,
    is_read: bool,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = RepoError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            kind: row.kind.parse()?,
            title: row.title,
            body: row.body,
            data: serde_json::from_str(&row.data_json)?,
            is_read: row.is_read,
            created_at: row.created_at,
            read_at: row.read_at,
        })
    }
}

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: NewNotification) -> Result<Notification, RepoError> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO notifications \
             (id, user_id, kind, title, body, data_json, is_read, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(&record.user_id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.body)
        .bind(serde_json::to_string(&record.data)?)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(Notification {
            id,
            user_id: record.user_id,
            kind: record.kind,
            title: record.title,
            body: record.body,
            data: record.data,
            is_read: false,
            created_at: record.created_at,
            read_at: None,
        })
    }

    pub async fn list(
        &self,
        user_id: &str,
        unread_only: bool,
        page: PageRequest,
    ) -> Result<Page<Notification>, RepoError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND (? = 0 OR is_read = 0)",
        )
        .bind(user_id)
        .bind(unread_only)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE user_id = ? AND (? = 0 OR is_read = 0) \
             ORDER BY created_at DESC, id LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, NotificationRow>(&sql)
            .bind(user_id)
            .bind(unread_only)
            .bind(i64::from(page.limit()))
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(Notification::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64, RepoError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Marks one notification of the user as read. Already-read rows keep
    /// their original `read_at`.
    pub async fn mark_read(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = 1, read_at = COALESCE(read_at, ?) \
             WHERE id = ? AND user_id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    pub async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = 1, read_at = ? WHERE user_id = ? AND is_read = 0",
        )
        .bind(to_rfc3339(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        expect_one(result.rows_affected())
    }

    /// Deletes read notifications created before `cutoff`.
    pub async fn purge_read_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM notifications WHERE is_read = 1 AND created_at < ?")
            .bind(to_rfc3339(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
