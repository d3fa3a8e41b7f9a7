use std::{sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use jobboard_storage::{Database, RepoError};

use crate::router::Clock;

const READ_NOTIFICATION_RETENTION_DAYS: i64 = 90;

/// Counts of rows touched by one maintenance cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub jobs_closed: u64,
    pub subscriptions_expired: u64,
    pub notifications_purged: u64,
    pub tokens_purged: u64,
    pub busy: bool,
}

/// Background worker that closes expired jobs, expires ended subscriptions
/// and purges stale rows.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Clock,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(database: Database, interval: Duration) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            interval,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle. A task that hits SQLite's busy
    /// timeout is skipped until the next tick.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let start = std::time::Instant::now();
        let now = (self.clock)();
        let mut report = MaintenanceReport::default();

        let jobs = self.database.jobs();
        report.jobs_closed = self
            .task("close_expired_jobs", &mut report.busy, jobs.close_expired(now))
            .await?;

        let billing = self.database.billing();
        report.subscriptions_expired = self
            .task("expire_subscriptions", &mut report.busy, billing.expire_ended(now))
            .await?;

        let cutoff = now - ChronoDuration::days(READ_NOTIFICATION_RETENTION_DAYS);
        let notifications = self.database.notifications();
        report.notifications_purged = self
            .task(
                "purge_notifications",
                &mut report.busy,
                notifications.purge_read_before(cutoff),
            )
            .await?;

        let tokens = self.database.tokens();
        report.tokens_purged = self
            .task("purge_tokens", &mut report.busy, tokens.purge_stale(now))
            .await?;

        histogram!("db_maintenance_seconds").record(start.elapsed().as_secs_f64());
        info!(
            stage = "storage",
            jobs_closed = report.jobs_closed,
            subscriptions_expired = report.subscriptions_expired,
            notifications_purged = report.notifications_purged,
            tokens_purged = report.tokens_purged,
            busy = report.busy,
            "maintenance cycle completed"
        );
        Ok(report)
    }

    async fn task<Fut>(
        &self,
        task: &'static str,
        busy: &mut bool,
        work: Fut,
    ) -> Result<u64, MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, RepoError>>,
    {
        match work.await {
            Ok(affected) => {
                counter!("db_maintenance_total", "task" => task).increment(affected);
                Ok(affected)
            }
            Err(err) if is_sqlite_busy(&err) => {
                *busy = true;
                counter!("db_busy_total", "op" => task).increment(1);
                warn!(stage = "storage", %task, error = %err, "maintenance task hit busy timeout");
                Ok(0)
            }
            Err(source) => Err(MaintenanceError { task, source }),
        }
    }
}

#[derive(Debug, Error)]
#[error("maintenance task {task} failed")]
pub struct MaintenanceError {
    task: &'static str,
    #[source]
    source: RepoError,
}

fn is_sqlite_busy(err: &RepoError) -> bool {
    match err {
        RepoError::Database(sqlx::Error::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use jobboard_core::access::Role;
    use jobboard_core::types::{JobStatus, NotificationKind, SubscriptionStatus};
    use jobboard_storage::{NewToken, SettlementOutcome};

    use crate::test_support::TestApp;

    fn worker_at(app: &TestApp) -> MaintenanceWorker {
        let now = app.now();
        MaintenanceWorker::new(app.db().clone(), Duration::from_secs(60))
            .with_clock(Arc::new(move || now))
    }

    #[tokio::test]
    async fn run_once_closes_expires_and_purges() {
        let app = TestApp::new().await;
        let (owner, _, company) = app.employer("owner@example.com", "Acme").await;
        let (seeker, _) = app.user("ada@example.com", Role::JobSeeker).await;

        let expiring = app.published_job(&company, &owner, "Expiring").await;
        let open = app.published_job(&company, &owner, "Open").await;
        sqlx::query("UPDATE jobs SET deadline = ? WHERE id = ?")
            .bind("2024-06-10T00:00:00.000Z")
            .bind(&expiring.id)
            .execute(app.db().pool())
            .await
            .unwrap();

        let billing = app.db().billing();
        let plan = billing.find_plan_by_code("basic").await.unwrap().unwrap();
        billing
            .create_pending(&company.id, &plan, "pay_maintenance", app.now())
            .await
            .unwrap();
        let outcome = billing
            .settle_payment("pay_maintenance", true, app.now())
            .await
            .unwrap();
        let SettlementOutcome::Applied { subscription, .. } = outcome else {
            panic!("payment should settle");
        };

        let notifier = app.state.notifier();
        let read = notifier
            .notify(&seeker.id, NotificationKind::System, "Old", "Read", json!({}))
            .await
            .unwrap();
        notifier
            .notify(&seeker.id, NotificationKind::System, "Old", "Unread", json!({}))
            .await
            .unwrap();
        app.db()
            .notifications()
            .mark_read(&seeker.id, &read.id, app.now())
            .await
            .unwrap();

        app.db()
            .tokens()
            .insert_refresh(NewToken {
                user_id: &seeker.id,
                token_hash: "stale",
                expires_at: app.now() + ChronoDuration::days(1),
                created_at: app.now(),
            })
            .await
            .unwrap();

        let first = worker_at(&app).run_once().await.expect("run_once");
        assert_eq!(first, MaintenanceReport::default());

        app.advance(ChronoDuration::days(91));
        let report = worker_at(&app).run_once().await.expect("run_once");
        assert_eq!(report.jobs_closed, 1);
        assert_eq!(report.subscriptions_expired, 1);
        assert_eq!(report.notifications_purged, 1);
        assert_eq!(report.tokens_purged, 1);
        assert!(!report.busy);

        let jobs = app.db().jobs();
        assert_eq!(jobs.find(&expiring.id).await.unwrap().unwrap().status, JobStatus::Closed);
        assert_eq!(jobs.find(&open.id).await.unwrap().unwrap().status, JobStatus::Published);

        let (_, page) = app
            .get("/admin/subscriptions?status=expired", Some(&app.admin().await.1))
            .await;
        assert_eq!(page["items"][0]["id"], subscription.id.as_str());
        assert_eq!(page["items"][0]["status"], SubscriptionStatus::Expired.as_str());

        let remaining = app.db().notifications().unread_count(&seeker.id).await.unwrap();
        assert_eq!(remaining, 1);

        let again = worker_at(&app).run_once().await.expect("run_once");
        assert_eq!(again, MaintenanceReport::default());
    }
}
