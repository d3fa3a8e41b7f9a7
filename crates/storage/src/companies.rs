use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::search::like_pattern;
use jobboard_core::slug;
use jobboard_core::types::Company;

use crate::users::expect_one;
use crate::{new_id, to_rfc3339, to_u64, RepoError};

const COMPANY_COLUMNS: &str = "id, owner_id, name, slug, description, website, industry, size, \
     location, logo_url, is_verified, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct CompanyRepository {
    pool: SqlitePool,
}

pub struct NewCompany {
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub website: Option<String>,
    pub industry: Option<String>,
    pub size: Option<String>,
    pub location: Option<String>,
    pub logo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CompanyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub website: Option<String>,
    pub industry: Option<String>,
    pub size: Option<String>,
    pub location: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CompanyRow {
    id: String,
    owner_id: String,
    name: String,
    slug: String,
    description: Option<String>,
    website: Option<String>,
    industry: Option<String>,
    size: Option<String>,
    location: Option<String>,
    logo_url: Option<String>,
    is_verified: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<CompanyRow> for Company {
    fn from(row: CompanyRow) -> Self {
        Company {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            slug: row.slug,
            description: row.description,
            website: row.website,
            industry: row.industry,
            size: row.size,
            location: row.location,
            logo_url: row.logo_url,
            is_verified: row.is_verified,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

impl CompanyRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the company, picks a free slug and links the owner to it.
    ///
    /// Fails with [`RepoError::Conflict`] when the owner already belongs to a company.
    pub async fn create(&self, record: NewCompany) -> Result<Company, RepoError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<Option<String>> =
            sqlx::query_scalar("SELECT company_id FROM users WHERE id = ? AND deleted_at IS NULL")
                .bind(&record.owner_id)
                .fetch_optional(&mut *tx)
                .await?;
        match current {
            None => return Err(RepoError::NotFound),
            Some(Some(_)) => return Err(RepoError::Conflict("user already belongs to a company")),
            Some(None) => {}
        }

        let slug = free_slug(&mut *tx, "companies", &slug::slugify(&record.name)).await?;
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);
        sqlx::query(
            "INSERT INTO companies (id, owner_id, name, slug, description, website, industry, \
             size, location, logo_url, is_verified, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(&record.owner_id)
        .bind(&record.name)
        .bind(&slug)
        .bind(&record.description)
        .bind(&record.website)
        .bind(&record.industry)
        .bind(&record.size)
        .bind(&record.location)
        .bind(&record.logo_url)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET company_id = ?, updated_at = ? WHERE id = ?")
            .bind(&id)
            .bind(&created_at)
            .bind(&record.owner_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.find(&id).await?.ok_or(RepoError::NotFound)
    }

    /// Loads a live company.
    pub async fn find(&self, id: &str) -> Result<Option<Company>, RepoError> {
        let sql = format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ? AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, CompanyRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Company::from))
    }

    pub async fn list(
        &self,
        q: Option<&str>,
        industry: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Company>, RepoError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM companies");
        push_company_filter(&mut count, q, industry);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {COMPANY_COLUMNS} FROM companies"));
        push_company_filter(&mut select, q, industry);
        select
            .push(" ORDER BY is_verified DESC, name COLLATE NOCASE, id LIMIT ")
            .push_bind(i64::from(page.limit()))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select
            .build_query_as::<CompanyRow>()
            .fetch_all(&self.pool)
            .await?;

        let items = rows.into_iter().map(Company::from).collect();
        Ok(Page::new(items, to_u64(total), page))
    }

    /// Applies the set fields. The slug stays stable across renames.
    pub async fn update(
        &self,
        id: &str,
        update: CompanyUpdate,
        now: DateTime<Utc>,
    ) -> Result<Company, RepoError> {
        let result = sqlx::query(
            "UPDATE companies SET name = COALESCE(?, name), \
             description = COALESCE(?, description), \
             website = COALESCE(?, website), industry = COALESCE(?, industry), \
             size = COALESCE(?, size), location = COALESCE(?, location), \
             logo_url = COALESCE(?, logo_url), updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(update.name)
        .bind(update.description)
        .bind(update.website)
        .bind(update.industry)
        .bind(update.size)
        .bind(update.location)
        .bind(update.logo_url)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn set_verified(
        &self,
        id: &str,
        is_verified: bool,
        now: DateTime<Utc>,
    ) -> Result<Company, RepoError> {
        let result = sqlx::query(
            "UPDATE companies SET is_verified = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(is_verified)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    /// Soft-deletes the company, closes its open jobs and unlinks its members.
    /// Returns the number of jobs that were closed.
    pub async fn soft_delete(&self, id: &str, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE companies SET deleted_at = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        expect_one(result.rows_affected())?;

        let closed = sqlx::query(
            "UPDATE jobs SET status = 'closed', updated_at = ? \
             WHERE company_id = ? AND status != 'closed' AND deleted_at IS NULL",
        )
        .bind(&stamp)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET company_id = NULL, updated_at = ? WHERE company_id = ?")
            .bind(&stamp)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(closed.rows_affected())
    }

    /// Links a user without a company. Conflict when the user is already linked.
    pub async fn add_member(
        &self,
        company_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE users SET company_id = ?, updated_at = ? \
             WHERE id = ? AND company_id IS NULL AND deleted_at IS NULL",
        )
        .bind(company_id)
        .bind(to_rfc3339(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict("user already belongs to a company"));
        }
        Ok(())
    }

    pub async fn remove_member(
        &self,
        company_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE users SET company_id = NULL, updated_at = ? WHERE id = ? AND company_id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(user_id)
        .bind(company_id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }

    /// Ids of the live users linked to the company.
    pub async fn member_ids(&self, company_id: &str) -> Result<Vec<String>, RepoError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM users WHERE company_id = ? AND deleted_at IS NULL ORDER BY created_at",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

/// First slug derived from `base` that is not taken in `table`, deleted rows included.
pub(crate) async fn free_slug(
    conn: &mut SqliteConnection,
    table: &str,
    base: &str,
) -> Result<String, RepoError> {
    let sql = format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE slug = ?)");
    for candidate in slug::candidates(base) {
        let taken: bool = sqlx::query_scalar(&sql)
            .bind(&candidate)
            .fetch_one(&mut *conn)
            .await?;
        if !taken {
            return Ok(candidate);
        }
    }
    Err(RepoError::Conflict("no free slug"))
}

fn push_company_filter(
    builder: &mut QueryBuilder<'_, Sqlite>,
    q: Option<&str>,
    industry: Option<&str>,
) {
    builder.push(" WHERE deleted_at IS NULL");
    if let Some(q) = q.map(str::trim).filter(|q| !q.is_empty()) {
        builder
            .push(" AND LOWER(name) LIKE ")
            .push_bind(like_pattern(&q.to_lowercase()))
            .push(" ESCAPE '\\'");
    }
    if let Some(industry) = industry.map(str::trim).filter(|value| !value.is_empty()) {
        builder
            .push(" AND LOWER(industry) = ")
            .push_bind(industry.to_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use jobboard_core::access::Role;

    #[tokio::test]
    async fn create_links_owner_and_dedupes_slug() {
        let db = setup_db().await;
        let (owner, first) = insert_company(&db, "a@acme.io", "Acme Corp").await;
        let (_, second) = insert_company(&db, "b@acme.io", "ACME corp!").await;

        let repo = db.companies();
        let first = repo.find(&first).await.unwrap().unwrap();
        let second = repo.find(&second).await.unwrap().unwrap();
        assert_eq!(first.slug, "acme-corp");
        assert_eq!(second.slug, "acme-corp-2");

        let user = db.users().find_by_id(&owner).await.unwrap().unwrap();
        assert_eq!(user.company_id.as_deref(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn owner_cannot_create_second_company() {
        let db = setup_db().await;
        let (owner, _) = insert_company(&db, "a@acme.io", "Acme").await;
        let err = db
            .companies()
            .create(NewCompany {
                owner_id: owner,
                name: "Other".into(),
                description: None,
                website: None,
                industry: None,
                size: None,
                location: None,
                logo_url: None,
                created_at: ts("2024-01-02T00:00:00Z"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
    }

    #[tokio::test]
    async fn soft_delete_hides_company_and_unlinks_members() {
        let db = setup_db().await;
        let (owner, company) = insert_company(&db, "a@acme.io", "Acme").await;
        let hr = insert_user(&db, "hr@acme.io", Role::Hr).await;
        let repo = db.companies();
        let now = ts("2024-01-05T00:00:00Z");
        repo.add_member(&company, &hr, now).await.unwrap();
        assert!(matches!(
            repo.add_member(&company, &hr, now).await.unwrap_err(),
            RepoError::Conflict(_)
        ));
        let mut members = repo.member_ids(&company).await.unwrap();
        members.sort();
        let mut expected = vec![owner, hr];
        expected.sort();
        assert_eq!(members, expected);

        repo.soft_delete(&company, now).await.unwrap();
        assert!(repo.find(&company).await.unwrap().is_none());
        assert!(repo.member_ids(&company).await.unwrap().is_empty());
        let page = repo.list(None, None, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn list_filters_by_name_and_industry() {
        let db = setup_db().await;
        insert_company(&db, "a@acme.io", "Acme").await;
        insert_company(&db, "b@globex.io", "Globex").await;
        let repo = db.companies();

        let page = repo
            .list(Some("glob"), Some("Software"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].name, "Globex");

        let none = repo
            .list(None, Some("farming"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(none.total, 0);
    }
}
