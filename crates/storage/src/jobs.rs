use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::search::{like_pattern, JobSearch, JobSort};
use jobboard_core::types::{EmploymentType, ExperienceLevel, Job, JobStatus};

use crate::users::expect_one;
use crate::{new_id, opt_rfc3339, to_rfc3339, to_u64, RepoError};

const JOB_COLUMNS: &str = "id, company_id, posted_by, title, description, requirements, location, \
     employment_type, experience_level, salary_min, salary_max, currency, is_remote, status, \
     is_featured, views_count, deadline, published_at, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

pub struct NewJob {
    pub company_id: String,
    pub posted_by: String,
    pub title: String,
    pub description: String,
    pub requirements: Option<String>,
    pub location: String,
    pub employment_type: EmploymentType,
    pub experience_level: ExperienceLevel,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub currency: String,
    pub is_remote: bool,
    pub is_featured: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Partial update; `None` keeps the stored value. The nullable columns take
/// `Some(None)` to clear them.
#[derive(Debug, Default)]
pub struct JobUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub requirements: Option<Option<String>>,
    pub location: Option<String>,
    pub employment_type: Option<EmploymentType>,
    pub experience_level: Option<ExperienceLevel>,
    pub salary_min: Option<Option<i64>>,
    pub salary_max: Option<Option<i64>>,
    pub currency: Option<String>,
    pub is_remote: Option<bool>,
    pub is_featured: Option<bool>,
    pub deadline: Option<Option<DateTime<Utc>>>,
}

/// Plan limits a publish is checked against.
#[derive(Debug, Clone, Copy)]
pub struct PublishLimits {
    pub jobs: i64,
    pub featured: i64,
}

#[derive(Debug)]
pub enum PublishOutcome {
    Published(Job),
    QuotaExceeded,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    company_id: String,
    posted_by: String,
    title: String,
    description: String,
    requirements: Option<String>,
    location: String,
    employment_type: String,
    experience_level: String,
    salary_min: Option<i64>,
    salary_max: Option<i64>,
    currency: String,
    is_remote: bool,
    status: String,
    is_featured: bool,
    views_count: i64,
    deadline: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            company_id: row.company_id,
            posted_by: row.posted_by,
            title: row.title,
            description: row.description,
            requirements: row.requirements,
            location: row.location,
            employment_type: row.employment_type.parse()?,
            experience_level: row.experience_level.parse()?,
            salary_min: row.salary_min,
            salary_max: row.salary_max,
            currency: row.currency,
            is_remote: row.is_remote,
            status: row.status.parse()?,
            is_featured: row.is_featured,
            views_count: row.views_count,
            deadline: row.deadline,
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn collect_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, RepoError> {
    rows.into_iter().map(Job::try_from).collect()
}

impl JobRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a draft job.
    pub async fn insert(&self, record: NewJob) -> Result<Job, RepoError> {
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);
        sqlx::query(
            "INSERT INTO jobs (id, company_id, posted_by, title, description, requirements, \
             location, employment_type, experience_level, salary_min, salary_max, currency, \
             is_remote, status, is_featured, views_count, deadline, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&record.company_id)
        .bind(&record.posted_by)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.requirements)
        .bind(&record.location)
        .bind(record.employment_type.as_str())
        .bind(record.experience_level.as_str())
        .bind(record.salary_min)
        .bind(record.salary_max)
        .bind(&record.currency)
        .bind(record.is_remote)
        .bind(JobStatus::Draft.as_str())
        .bind(record.is_featured)
        .bind(opt_rfc3339(record.deadline))
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        self.find(&id).await?.ok_or(RepoError::NotFound)
    }

    /// Loads a job that is not soft-deleted, whatever its status.
    pub async fn find(&self, id: &str) -> Result<Option<Job>, RepoError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ? AND deleted_at IS NULL");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    pub async fn update(
        &self,
        id: &str,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, RepoError> {
        let result = sqlx::query(
            "UPDATE jobs SET title = COALESCE(?, title), description = COALESCE(?, description), \
             requirements = CASE WHEN ? THEN ? ELSE requirements END, \
             location = COALESCE(?, location), \
             employment_type = COALESCE(?, employment_type), \
             experience_level = COALESCE(?, experience_level), \
             salary_min = CASE WHEN ? THEN ? ELSE salary_min END, \
             salary_max = CASE WHEN ? THEN ? ELSE salary_max END, \
             currency = COALESCE(?, currency), is_remote = COALESCE(?, is_remote), \
             is_featured = COALESCE(?, is_featured), \
             deadline = CASE WHEN ? THEN ? ELSE deadline END, \
             updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(update.title)
        .bind(update.description)
        .bind(update.requirements.is_some())
        .bind(update.requirements.flatten())
        .bind(update.location)
        .bind(update.employment_type.map(EmploymentType::as_str))
        .bind(update.experience_level.map(ExperienceLevel::as_str))
        .bind(update.salary_min.is_some())
        .bind(update.salary_min.flatten())
        .bind(update.salary_max.is_some())
        .bind(update.salary_max.flatten())
        .bind(update.currency)
        .bind(update.is_remote)
        .bind(update.is_featured)
        .bind(update.deadline.is_some())
        .bind(opt_rfc3339(update.deadline.flatten()))
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn soft_delete(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE jobs SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    /// Moves the job to `published` and stamps `published_at`.
    pub async fn publish(&self, id: &str, now: DateTime<Utc>) -> Result<Job, RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, published_at = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(JobStatus::Published.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    /// Publishes the job only while the company stays within `limits`. The
    /// counts and the update run as one statement, so concurrent publishes
    /// cannot both take the last slot.
    pub async fn publish_within(
        &self,
        id: &str,
        limits: PublishLimits,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE jobs SET status = 'published', published_at = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL \
             AND (SELECT COUNT(*) FROM jobs other WHERE other.company_id = jobs.company_id \
                  AND other.status = 'published' AND other.deleted_at IS NULL \
                  AND other.id != jobs.id) < ? \
             AND (jobs.is_featured = 0 OR \
                  (SELECT COUNT(*) FROM jobs other WHERE other.company_id = jobs.company_id \
                   AND other.status = 'published' AND other.is_featured = 1 \
                   AND other.deleted_at IS NULL AND other.id != jobs.id) < ?)",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .bind(limits.jobs)
        .bind(limits.featured)
        .execute(&self.pool)
        .await?;

        let job = self.find(id).await?.ok_or(RepoError::NotFound)?;
        if result.rows_affected() == 0 {
            Ok(PublishOutcome::QuotaExceeded)
        } else {
            Ok(PublishOutcome::Published(job))
        }
    }

    pub async fn close(&self, id: &str, now: DateTime<Utc>) -> Result<Job, RepoError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(JobStatus::Closed.as_str())
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn increment_views(&self, id: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE jobs SET views_count = views_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Public search over active jobs. Filters are appended as bound parameters.
    pub async fn search(
        &self,
        search: &JobSearch,
        now: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<Job>, RepoError> {
        let now = to_rfc3339(now);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs");
        push_active(&mut count, &now);
        push_search_filters(&mut count, search);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
        push_active(&mut select, &now);
        push_search_filters(&mut select, search);
        select.push(match search.sort {
            JobSort::Newest => " ORDER BY is_featured DESC, published_at DESC, id",
            JobSort::Salary => {
                " ORDER BY COALESCE(salary_max, salary_min) IS NULL, \
                 COALESCE(salary_max, salary_min) DESC, published_at DESC, id"
            }
        });
        push_page(&mut select, page);
        let rows = select.build_query_as::<JobRow>().fetch_all(&self.pool).await?;

        Ok(Page::new(collect_jobs(rows)?, to_u64(total), page))
    }

    /// Jobs of one company. With `include_all` every live status is returned,
    /// otherwise only active jobs.
    pub async fn list_for_company(
        &self,
        company_id: &str,
        include_all: bool,
        now: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<Job>, RepoError> {
        let now = to_rfc3339(now);
        let scope = |builder: &mut QueryBuilder<'_, Sqlite>| {
            if include_all {
                builder.push(" WHERE deleted_at IS NULL");
            } else {
                push_active(builder, &now);
            }
            builder.push(" AND company_id = ").push_bind(company_id.to_string());
        };

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs");
        scope(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
        scope(&mut select);
        select.push(" ORDER BY created_at DESC, id");
        push_page(&mut select, page);
        let rows = select.build_query_as::<JobRow>().fetch_all(&self.pool).await?;

        Ok(Page::new(collect_jobs(rows)?, to_u64(total), page))
    }

    /// Published jobs of the company, as counted against the plan quota.
    pub async fn count_published(&self, company_id: &str) -> Result<i64, RepoError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs \
             WHERE company_id = ? AND status = 'published' AND deleted_at IS NULL",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_featured(&self, company_id: &str) -> Result<i64, RepoError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE company_id = ? AND status = 'published' \
             AND is_featured = 1 AND deleted_at IS NULL",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Closes published jobs whose deadline has passed.
    pub async fn close_expired(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let now = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE jobs SET status = 'closed', updated_at = ? \
             WHERE status = 'published' AND deleted_at IS NULL \
             AND deadline IS NOT NULL AND deadline <= ?",
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn push_active(builder: &mut QueryBuilder<'_, Sqlite>, now: &str) {
    builder
        .push(
            " WHERE status = 'published' AND deleted_at IS NULL \
             AND (deadline IS NULL OR deadline > ",
        )
        .push_bind(now.to_string())
        .push(")");
}

fn push_search_filters(builder: &mut QueryBuilder<'_, Sqlite>, search: &JobSearch) {
    if let Some(q) = search.q.as_deref() {
        let pattern = like_pattern(&q.to_lowercase());
        builder
            .push(" AND (LOWER(title) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(description) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(COALESCE(requirements, '')) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    if let Some(location) = search.location.as_deref() {
        builder
            .push(" AND LOWER(location) LIKE ")
            .push_bind(like_pattern(&location.to_lowercase()))
            .push(" ESCAPE '\\'");
    }
    if let Some(kind) = search.employment_type {
        builder.push(" AND employment_type = ").push_bind(kind.as_str());
    }
    if let Some(level) = search.experience_level {
        builder.push(" AND experience_level = ").push_bind(level.as_str());
    }
    if let Some(remote) = search.is_remote {
        builder.push(" AND is_remote = ").push_bind(remote);
    }
    if let Some(company_id) = search.company_id.as_deref() {
        builder.push(" AND company_id = ").push_bind(company_id.to_string());
    }
    if let Some(min) = search.salary_min {
        builder
            .push(" AND (salary_max IS NULL OR salary_max >= ")
            .push_bind(min)
            .push(")");
    }
    if let Some(max) = search.salary_max {
        builder
            .push(" AND (salary_min IS NULL OR salary_min <= ")
            .push_bind(max)
            .push(")");
    }
}

fn push_page(builder: &mut QueryBuilder<'_, Sqlite>, page: PageRequest) {
    builder
        .push(" LIMIT ")
        .push_bind(i64::from(page.limit()))
        .push(" OFFSET ")
        .push_bind(page.offset() as i64);
}
