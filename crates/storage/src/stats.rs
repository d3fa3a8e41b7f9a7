use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::{to_rfc3339, RepoError};

#[derive(Clone)]
pub struct StatsRepository {
    pool: SqlitePool,
}

/// Platform-wide counters for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformStats {
    pub users_by_role: BTreeMap<String, i64>,
    pub companies: i64,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub applications_by_status: BTreeMap<String, i64>,
    pub active_subscriptions: i64,
    pub revenue_cents: i64,
}

impl StatsRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn collect(&self, now: DateTime<Utc>) -> Result<PlatformStats, RepoError> {
        let users_by_role = self
            .grouped("SELECT role, COUNT(*) FROM users WHERE deleted_at IS NULL GROUP BY role")
            .await?;
        let jobs_by_status = self
            .grouped("SELECT status, COUNT(*) FROM jobs WHERE deleted_at IS NULL GROUP BY status")
            .await?;
        let applications_by_status = self
            .grouped("SELECT status, COUNT(*) FROM applications GROUP BY status")
            .await?;

        let companies =
            sqlx::query_scalar("SELECT COUNT(*) FROM companies WHERE deleted_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        let active_subscriptions = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE status = 'active' AND ends_at > ?",
        )
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await?;
        let revenue_cents = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM payments WHERE status = 'succeeded'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PlatformStats {
            users_by_role,
            companies,
            jobs_by_status,
            applications_by_status,
            active_subscriptions,
            revenue_cents,
        })
    }

    async fn grouped(&self, sql: &str) -> Result<BTreeMap<String, i64>, RepoError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use jobboard_core::access::Role;

    #[tokio::test]
    async fn counts_live_records() {
        let db = setup_db().await;
        insert_company(&db, "a@acme.io", "Acme").await;
        insert_user(&db, "s1@example.com", Role::JobSeeker).await;
        let gone = insert_user(&db, "s2@example.com", Role::JobSeeker).await;
        db.users().soft_delete(&gone, ts("2024-01-02T00:00:00Z")).await.unwrap();

        let billing = db.billing();
        let (_, company) = insert_company(&db, "b@globex.io", "Globex").await;
        let basic = billing.find_plan_by_code("basic").await.unwrap().unwrap();
        billing
            .create_pending(&company, &basic, "ref", ts("2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        billing
            .settle_payment("ref", true, ts("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let stats = db.stats().collect(ts("2024-01-10T00:00:00Z")).await.unwrap();
        assert_eq!(stats.users_by_role.get("job_seeker"), Some(&1));
        assert_eq!(stats.users_by_role.get("employer"), Some(&2));
        assert_eq!(stats.companies, 2);
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.revenue_cents, 4900);
        assert!(stats.jobs_by_status.is_empty());
    }
}
