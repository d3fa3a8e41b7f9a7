use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use jobboard_core::application::ApplicationStatus;
use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::Application;

use crate::{conflict_on_unique, new_id, to_rfc3339, to_u64, RepoError};

const VIEW_SELECT: &str = "SELECT a.id, a.job_id, a.applicant_id, a.cv_id, a.cover_letter, \
     a.status, a.employer_note, a.created_at, a.updated_at, j.title AS job_title, j.company_id, \
     c.name AS company_name, u.full_name AS applicant_name, u.email AS applicant_email \
     FROM applications a \
     JOIN jobs j ON j.id = a.job_id \
     JOIN companies c ON c.id = j.company_id \
     JOIN users u ON u.id = a.applicant_id";

#[derive(Clone)]
pub struct ApplicationRepository {
    pool: SqlitePool,
}

pub struct NewApplication {
    pub job_id: String,
    pub applicant_id: String,
    pub cv_id: Option<String>,
    pub cover_letter: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Application joined with the job, company and applicant it refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationView {
    #[serde(flatten)]
    pub application: Application,
    pub job_title: String,
    pub company_id: String,
    pub company_name: String,
    pub applicant_name: String,
    pub applicant_email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ApplicationRow {
    id: String,
    job_id: String,
    applicant_id: String,
    cv_id: Option<String>,
    cover_letter: Option<String>,
    status: String,
    employer_note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = RepoError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Application {
            id: row.id,
            job_id: row.job_id,
            applicant_id: row.applicant_id,
            cv_id: row.cv_id,
            cover_letter: row.cover_letter,
            status: row.status.parse()?,
            employer_note: row.employer_note,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ViewRow {
    #[sqlx(flatten)]
    application: ApplicationRow,
    job_title: String,
    company_id: String,
    company_name: String,
    applicant_name: String,
    applicant_email: String,
}

impl TryFrom<ViewRow> for ApplicationView {
    type Error = RepoError;

    fn try_from(row: ViewRow) -> Result<Self, Self::Error> {
        Ok(ApplicationView {
            application: row.application.try_into()?,
            job_title: row.job_title,
            company_id: row.company_id,
            company_name: row.company_name,
            applicant_name: row.applicant_name,
            applicant_email: row.applicant_email,
        })
    }
}

/// Which side of the application a listing is for.
#[derive(Clone, Copy)]
enum Scope<'a> {
    Applicant(&'a str),
    Job(&'a str),
}

impl ApplicationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a `pending` application. A second application to the same job
    /// by the same user is a conflict.
    pub async fn insert(&self, record: NewApplication) -> Result<Application, RepoError> {
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);
        sqlx::query(
            "INSERT INTO applications (id, job_id, applicant_id, cv_id, cover_letter, status, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&record.job_id)
        .bind(&record.applicant_id)
        .bind(&record.cv_id)
        .bind(&record.cover_letter)
        .bind(ApplicationStatus::Pending.as_str())
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_on_unique(err, "already applied to this job"))?;

        self.find(&id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Application>, RepoError> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, job_id, applicant_id, cv_id, cover_letter, status, employer_note, \
             created_at, updated_at FROM applications WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Application::try_from).transpose()
    }

    pub async fn find_view(&self, id: &str) -> Result<Option<ApplicationView>, RepoError> {
        let sql = format!("{VIEW_SELECT} WHERE a.id = ?");
        let row = sqlx::query_as::<_, ViewRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ApplicationView::try_from).transpose()
    }

    pub async fn list_for_applicant(
        &self,
        applicant_id: &str,
        status: Option<ApplicationStatus>,
        page: PageRequest,
    ) -> Result<Page<ApplicationView>, RepoError> {
        self.list(Scope::Applicant(applicant_id), status, page).await
    }

    pub async fn list_for_job(
        &self,
        job_id: &str,
        status: Option<ApplicationStatus>,
        page: PageRequest,
    ) -> Result<Page<ApplicationView>, RepoError> {
        self.list(Scope::Job(job_id), status, page).await
    }

    async fn list(
        &self,
        scope: Scope<'_>,
        status: Option<ApplicationStatus>,
        page: PageRequest,
    ) -> Result<Page<ApplicationView>, RepoError> {
        let filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            match scope {
                Scope::Applicant(id) => {
                    builder.push(" WHERE a.applicant_id = ").push_bind(id.to_string())
                }
                Scope::Job(id) => builder.push(" WHERE a.job_id = ").push_bind(id.to_string()),
            };
            if let Some(status) = status {
                builder.push(" AND a.status = ").push_bind(status.as_str());
            }
        };

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM applications a");
        filter(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(VIEW_SELECT);
        filter(&mut select);
        select
            .push(" ORDER BY a.created_at DESC, a.id LIMIT ")
            .push_bind(i64::from(page.limit()))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select.build_query_as::<ViewRow>().fetch_all(&self.pool).await?;

        let items = rows
            .into_iter()
            .map(ApplicationView::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    /// Moves the application from `from` to `to`. The update only applies while
    /// the stored status is still `from`; otherwise it is a conflict.
    pub async fn update_status(
        &self,
        id: &str,
        from: ApplicationStatus,
        to: ApplicationStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Application, RepoError> {
        let result = sqlx::query(
            "UPDATE applications SET status = ?, employer_note = COALESCE(?, employer_note), \
             updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(note)
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict("application status changed concurrently"));
        }
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    /// Whether the company received an application that carries this CV.
    pub async fn cv_shared_with_company(
        &self,
        cv_id: &str,
        company_id: &str,
    ) -> Result<bool, RepoError> {
        let shared = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM applications a JOIN jobs j ON j.id = a.job_id \
             WHERE a.cv_id = ? AND j.company_id = ?)",
        )
        .bind(cv_id)
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(shared)
    }
}
