use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Conversation, Message};

use crate::{new_id, to_rfc3339, to_u64, RepoError};

/// Direct messages between two users.
#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: String,
    sender_id: String,
    recipient_id: String,
    body: String,
    is_read: bool,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            body: row.body,
            is_read: row.is_read,
            created_at: row.created_at,
            read_at: row.read_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    #[sqlx(flatten)]
    message: MessageRow,
    counterpart_id: String,
    counterpart_name: String,
    unread_count: i64,
}

// Latest message per counterpart, with the unread count from that counterpart.
const CONVERSATIONS_SQL: &str = "\
WITH me(id) AS (SELECT ?), \
pairs AS ( \
    SELECT m.*, \
    CASE WHEN m.sender_id = me.id THEN m.recipient_id ELSE m.sender_id END AS counterpart_id \
    FROM messages m, me WHERE m.sender_id = me.id OR m.recipient_id = me.id \
), \
ranked AS ( \
    SELECT p.*, ROW_NUMBER() OVER \
    (PARTITION BY p.counterpart_id ORDER BY p.created_at DESC, p.id DESC) AS rn \
    FROM pairs p \
) \
SELECT r.id, r.sender_id, r.recipient_id, r.body, r.is_read, r.created_at, r.read_at, \
    r.counterpart_id, u.full_name AS counterpart_name, \
    (SELECT COUNT(*) FROM messages x, me \
     WHERE x.sender_id = r.counterpart_id AND x.recipient_id = me.id AND x.is_read = 0) \
    AS unread_count \
FROM ranked r JOIN users u ON u.id = r.counterpart_id \
WHERE r.rn = 1 \
ORDER BY r.created_at DESC, r.id DESC";

impl MessageRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        sender_id: &str,
        recipient_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Message, RepoError> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO messages (id, sender_id, recipient_id, body, is_read, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(sender_id)
        .bind(recipient_id)
        .bind(body)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id,
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            body: body.to_string(),
            is_read: false,
            created_at: now,
            read_at: None,
        })
    }

    pub async fn conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RepoError> {
        let rows = sqlx::query_as::<_, ConversationRow>(CONVERSATIONS_SQL)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Conversation {
                counterpart_id: row.counterpart_id,
                counterpart_name: row.counterpart_name,
                last_message: row.message.into(),
                unread_count: row.unread_count,
            })
            .collect())
    }

    /// Messages exchanged between the two users, newest first.
    pub async fn thread(
        &self,
        user_id: &str,
        other_id: &str,
        page: PageRequest,
    ) -> Result<Page<Message>, RepoError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages \
             WHERE (sender_id = ? AND recipient_id = ?) OR (sender_id = ? AND recipient_id = ?)",
        )
        .bind(user_id)
        .bind(other_id)
        .bind(other_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, sender_id, recipient_id, body, is_read, created_at, read_at FROM messages \
             WHERE (sender_id = ? AND recipient_id = ?) OR (sender_id = ? AND recipient_id = ?) \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(other_id)
        .bind(other_id)
        .bind(user_id)
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows.into_iter().map(Message::from).collect();
        Ok(Page::new(items, to_u64(total), page))
    }

    /// Marks everything `other_id` sent to `user_id` as read.
    pub async fn mark_thread_read(
        &self,
        user_id: &str,
        other_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1, read_at = ? \
             WHERE sender_id = ? AND recipient_id = ? AND is_read = 0",
        )
        .bind(to_rfc3339(now))
        .bind(other_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use jobboard_core::access::Role;
    use jobboard_core::pagination::PageRequest;

    #[tokio::test]
    async fn conversations_group_by_counterpart() {
        let db = setup_db().await;
        let ann = insert_user(&db, "ann@example.com", Role::JobSeeker).await;
        let bob = insert_user(&db, "bob@example.com", Role::Employer).await;
        let cat = insert_user(&db, "cat@example.com", Role::Hr).await;
        let repo = db.messages();

        repo.insert(&bob, &ann, "hi ann", ts("2024-01-01T10:00:00Z")).await.unwrap();
        repo.insert(&ann, &bob, "hi bob", ts("2024-01-01T11:00:00Z")).await.unwrap();
        repo.insert(&bob, &ann, "interview?", ts("2024-01-01T12:00:00Z")).await.unwrap();
        repo.insert(&cat, &ann, "hello", ts("2024-01-01T09:00:00Z")).await.unwrap();

        let list = repo.conversations(&ann).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].counterpart_id, bob);
        assert_eq!(list[0].counterpart_name, "bob");
        assert_eq!(list[0].last_message.body, "interview?");
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[1].counterpart_id, cat);
        assert_eq!(list[1].unread_count, 1);

        let bob_view = repo.conversations(&bob).await.unwrap();
        assert_eq!(bob_view.len(), 1);
        assert_eq!(bob_view[0].unread_count, 1);
    }

    #[tokio::test]
    async fn thread_is_newest_first_and_can_be_marked_read() {
        let db = setup_db().await;
        let ann = insert_user(&db, "ann@example.com", Role::JobSeeker).await;
        let bob = insert_user(&db, "bob@example.com", Role::Employer).await;
        let repo = db.messages();
        repo.insert(&bob, &ann, "first", ts("2024-01-01T10:00:00Z")).await.unwrap();
        repo.insert(&ann, &bob, "second", ts("2024-01-01T11:00:00Z")).await.unwrap();

        let thread = repo.thread(&ann, &bob, PageRequest::default()).await.unwrap();
        assert_eq!(thread.total, 2);
        assert_eq!(thread.items[0].body, "second");

        assert_eq!(
            repo.mark_thread_read(&ann, &bob, ts("2024-01-02T00:00:00Z")).await.unwrap(),
            1
        );
        let list = repo.conversations(&ann).await.unwrap();
        assert_eq!(list[0].unread_count, 0);
    }
}
