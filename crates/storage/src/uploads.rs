use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jobboard_core::types::Upload;

use crate::{new_id, to_rfc3339, RepoError};

#[derive(Clone)]
pub struct UploadRepository {
    pool: SqlitePool,
}

pub struct NewUpload {
    pub owner_id: String,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub stored_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct UploadRow {
    id: String,
    owner_id: String,
    original_name: String,
    content_type: String,
    size_bytes: i64,
    checksum: String,
    stored_name: String,
    created_at: DateTime<Utc>,
}

impl From<UploadRow> for Upload {
    fn from(row: UploadRow) -> Self {
        Upload {
            id: row.id,
            owner_id: row.owner_id,
            original_name: row.original_name,
            content_type: row.content_type,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            stored_name: row.stored_name,
            created_at: row.created_at,
        }
    }
}

impl UploadRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: NewUpload) -> Result<Upload, RepoError> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO uploads (id, owner_id, original_name, content_type, size_bytes, checksum, \
             stored_name, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&record.owner_id)
        .bind(&record.original_name)
        .bind(&record.content_type)
        .bind(record.size_bytes)
        .bind(&record.checksum)
        .bind(&record.stored_name)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await?;

        self.find(&id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Upload>, RepoError> {
        let row = sqlx::query_as::<_, UploadRow>(
            "SELECT id, owner_id, original_name, content_type, size_bytes, checksum, stored_name, \
             created_at FROM uploads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Upload::from))
    }
}
