use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jobboard_core::types::Cv;

use crate::users::expect_one;
use crate::{new_id, to_rfc3339, RepoError};

const CV_COLUMNS: &str = "id, user_id, title, summary, skills_json, experience_years, education, \
     upload_id, is_default, created_at, updated_at";

/// CV storage. Each user has at most one default CV among the live ones.
#[derive(Clone)]
pub struct CvRepository {
    pool: SqlitePool,
}

pub struct NewCv {
    pub user_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub skills: Vec<String>,
    pub experience_years: i64,
    pub education: Option<String>,
    pub upload_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partial update; `Some(None)` clears a nullable column.
#[derive(Debug, Default)]
pub struct CvUpdate {
    pub title: Option<String>,
    pub summary: Option<Option<String>>,
    pub skills: Option<Vec<String>>,
    pub experience_years: Option<i64>,
    pub education: Option<Option<String>>,
    pub upload_id: Option<Option<String>>,
}

#[derive(Debug, sqlx::FromRow)]
struct CvRow {
    id: String,
    user_id: String,
    title: String,
    summary: Option<String>,
    skills_json: String,
    experience_years: i64,
    education: Option<String>,
    upload_id: Option<String>,
    is_default: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CvRow> for Cv {
    type Error = RepoError;

    fn try_from(row: CvRow) -> Result<Self, Self::Error> {
        Ok(Cv {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            summary: row.summary,
            skills: serde_json::from_str(&row.skills_json)?,
            experience_years: row.experience_years,
            education: row.education,
            upload_id: row.upload_id,
            is_default: row.is_default,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl CvRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a CV. The user's first live CV becomes the default.
    pub async fn insert(&self, record: NewCv) -> Result<Cv, RepoError> {
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);
        let skills = serde_json::to_string(&record.skills)?;

        let mut tx = self.pool.begin().await?;
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cvs WHERE user_id = ? AND deleted_at IS NULL")
                .bind(&record.user_id)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO cvs (id, user_id, title, summary, skills_json, experience_years, \
             education, upload_id, is_default, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&record.user_id)
        .bind(&record.title)
        .bind(&record.summary)
        .bind(&skills)
        .bind(record.experience_years)
        .bind(&record.education)
        .bind(&record.upload_id)
        .bind(existing == 0)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.find(&id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Cv>, RepoError> {
        let sql = format!("SELECT {CV_COLUMNS} FROM cvs WHERE id = ? AND deleted_at IS NULL");
        let row = sqlx::query_as::<_, CvRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Cv::try_from).transpose()
    }

    /// Live CVs of the user, default first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Cv>, RepoError> {
        let sql = format!(
            "SELECT {CV_COLUMNS} FROM cvs WHERE user_id = ? AND deleted_at IS NULL \
             ORDER BY is_default DESC, created_at DESC, id"
        );
        let rows = sqlx::query_as::<_, CvRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Cv::try_from).collect()
    }

    pub async fn default_for_user(&self, user_id: &str) -> Result<Option<Cv>, RepoError> {
        let sql = format!(
            "SELECT {CV_COLUMNS} FROM cvs \
             WHERE user_id = ? AND deleted_at IS NULL AND is_default = 1"
        );
        let row = sqlx::query_as::<_, CvRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Cv::try_from).transpose()
    }

    pub async fn update(
        &self,
        id: &str,
        update: CvUpdate,
        now: DateTime<Utc>,
    ) -> Result<Cv, RepoError> {
        let skills = update.skills.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "UPDATE cvs SET title = COALESCE(?, title), \
             summary = CASE WHEN ? THEN ? ELSE summary END, \
             skills_json = COALESCE(?, skills_json), \
             experience_years = COALESCE(?, experience_years), \
             education = CASE WHEN ? THEN ? ELSE education END, \
             upload_id = CASE WHEN ? THEN ? ELSE upload_id END, \
             updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(update.title)
        .bind(update.summary.is_some())
        .bind(update.summary.flatten())
        .bind(skills)
        .bind(update.experience_years)
        .bind(update.education.is_some())
        .bind(update.education.flatten())
        .bind(update.upload_id.is_some())
        .bind(update.upload_id.flatten())
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    /// Makes `id` the user's default CV and clears the flag on the others.
    pub async fn set_default(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Cv, RepoError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE cvs SET is_default = 1, updated_at = ? \
             WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
        )
        .bind(&stamp)
        .bind(id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        expect_one(result.rows_affected())?;
        sqlx::query(
            "UPDATE cvs SET is_default = 0, updated_at = ? \
             WHERE user_id = ? AND id != ? AND is_default = 1",
        )
        .bind(&stamp)
        .bind(user_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    /// Soft-deletes a CV. When it was the default, the most recent remaining
    /// CV is promoted.
    pub async fn soft_delete(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let was_default: Option<bool> = sqlx::query_scalar(
            "SELECT is_default FROM cvs WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(was_default) = was_default else {
            return Err(RepoError::NotFound);
        };

        sqlx::query("UPDATE cvs SET deleted_at = ?, is_default = 0, updated_at = ? WHERE id = ?")
            .bind(&stamp)
            .bind(&stamp)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if was_default {
            sqlx::query(
                "UPDATE cvs SET is_default = 1, updated_at = ? WHERE id = ( \
                 SELECT id FROM cvs WHERE user_id = ? AND deleted_at IS NULL \
                 ORDER BY created_at DESC, id DESC LIMIT 1)",
            )
            .bind(&stamp)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
