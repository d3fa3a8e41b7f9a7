use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::search::like_pattern;
use jobboard_core::slug;
use jobboard_core::types::{BlogPost, PostStatus};

use crate::companies::free_slug;
use crate::users::expect_one;
use crate::{new_id, to_rfc3339, to_u64, RepoError};

const POST_COLUMNS: &str =
    "id, author_id, title, slug, excerpt, content, status, published_at, created_at, updated_at";

#[derive(Clone)]
pub struct BlogRepository {
    pool: SqlitePool,
}

pub struct NewPost {
    pub author_id: String,
    pub title: String,
    pub excerpt: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: String,
    author_id: String,
    title: String,
    slug: String,
    excerpt: Option<String>,
    content: String,
    status: String,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PostRow> for BlogPost {
    type Error = RepoError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        Ok(BlogPost {
            id: row.id,
            author_id: row.author_id,
            title: row.title,
            slug: row.slug,
            excerpt: row.excerpt,
            content: row.content,
            status: row.status.parse()?,
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl BlogRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a draft with a slug derived from the title.
    pub async fn insert(&self, record: NewPost) -> Result<BlogPost, RepoError> {
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);

        let mut tx = self.pool.begin().await?;
        let slug = free_slug(&mut *tx, "blog_posts", &slug::slugify(&record.title)).await?;
        sqlx::query(
            "INSERT INTO blog_posts (id, author_id, title, slug, excerpt, content, status, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&record.author_id)
        .bind(&record.title)
        .bind(&slug)
        .bind(&record.excerpt)
        .bind(&record.content)
        .bind(PostStatus::Draft.as_str())
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.find(&id).await?.ok_or(RepoError::NotFound)
    }

    /// Loads a live post in any status.
    pub async fn find(&self, id: &str) -> Result<Option<BlogPost>, RepoError> {
        let sql =
            format!("SELECT {POST_COLUMNS} FROM blog_posts WHERE id = ? AND deleted_at IS NULL");
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BlogPost::try_from).transpose()
    }

    pub async fn find_published_by_slug(&self, slug: &str) -> Result<Option<BlogPost>, RepoError> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM blog_posts \
             WHERE slug = ? AND status = 'published' AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BlogPost::try_from).transpose()
    }

    pub async fn list_published(
        &self,
        q: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<BlogPost>, RepoError> {
        let q = q.map(str::trim).filter(|q| !q.is_empty());
        let filter = |builder: &mut QueryBuilder<'_, Sqlite>| {
            builder.push(" WHERE status = 'published' AND deleted_at IS NULL");
            if let Some(q) = q {
                let pattern = like_pattern(&q.to_lowercase());
                builder
                    .push(" AND (LOWER(title) LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\' OR LOWER(content) LIKE ")
                    .push_bind(pattern)
                    .push(" ESCAPE '\\')");
            }
        };

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM blog_posts");
        filter(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {POST_COLUMNS} FROM blog_posts"));
        filter(&mut select);
        select
            .push(" ORDER BY published_at DESC, id LIMIT ")
            .push_bind(i64::from(page.limit()))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select.build_query_as::<PostRow>().fetch_all(&self.pool).await?;

        let items = rows
            .into_iter()
            .map(BlogPost::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    pub async fn update(
        &self,
        id: &str,
        update: PostUpdate,
        now: DateTime<Utc>,
    ) -> Result<BlogPost, RepoError> {
        let result = sqlx::query(
            "UPDATE blog_posts SET title = COALESCE(?, title), excerpt = COALESCE(?, excerpt), \
             content = COALESCE(?, content), updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(update.title)
        .bind(update.excerpt)
        .bind(update.content)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    /// Publishes the post. The first publication time is kept on re-publish.
    pub async fn publish(&self, id: &str, now: DateTime<Utc>) -> Result<BlogPost, RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE blog_posts SET status = ?, published_at = COALESCE(published_at, ?), \
             updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(PostStatus::Published.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find(id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn soft_delete(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE blog_posts SET deleted_at = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())
    }
}
