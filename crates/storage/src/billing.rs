use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use jobboard_core::pagination::{Page, PageRequest};
use jobboard_core::types::{Payment, PaymentStatus, Plan, Subscription, SubscriptionStatus};

use crate::users::expect_one;
use crate::{conflict_on_unique, new_id, to_rfc3339, to_u64, RepoError};

const PLAN_COLUMNS: &str = "id, code, name, price_cents, currency, duration_days, job_post_limit, \
     featured_job_limit, is_active";
const SUBSCRIPTION_COLUMNS: &str =
    "id, company_id, plan_id, status, starts_at, ends_at, created_at, updated_at";
const PAYMENT_COLUMNS: &str =
    "id, subscription_id, amount_cents, currency, status, reference, created_at, paid_at";

/// Plans, subscriptions and payments.
#[derive(Clone)]
pub struct BillingRepository {
    pool: SqlitePool,
}

pub struct NewPlan {
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub duration_days: i64,
    pub job_post_limit: i64,
    pub featured_job_limit: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub duration_days: Option<i64>,
    pub job_post_limit: Option<i64>,
    pub featured_job_limit: Option<i64>,
    pub is_active: Option<bool>,
}

/// Result of applying a payment-provider callback.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// The pending payment was settled and its subscription updated.
    Applied {
        payment: Payment,
        subscription: Subscription,
    },
    /// The payment had already been settled; nothing changed.
    AlreadySettled(Payment),
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    code: String,
    name: String,
    price_cents: i64,
    currency: String,
    duration_days: i64,
    job_post_limit: i64,
    featured_job_limit: i64,
    is_active: bool,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            code: row.code,
            name: row.name,
            price_cents: row.price_cents,
            currency: row.currency,
            duration_days: row.duration_days,
            job_post_limit: row.job_post_limit,
            featured_job_limit: row.featured_job_limit,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    company_id: String,
    plan_id: String,
    status: String,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = RepoError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            company_id: row.company_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: String,
    subscription_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    reference: String,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = RepoError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            subscription_id: row.subscription_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status.parse()?,
            reference: row.reference,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

impl BillingRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_plans(&self, active_only: bool) -> Result<Vec<Plan>, RepoError> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE (? = 0 OR is_active = 1) \
             ORDER BY price_cents, code"
        );
        let rows = sqlx::query_as::<_, PlanRow>(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    pub async fn find_plan(&self, id: &str) -> Result<Option<Plan>, RepoError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?");
        let row = sqlx::query_as::<_, PlanRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Plan::from))
    }

    pub async fn find_plan_by_code(&self, code: &str) -> Result<Option<Plan>, RepoError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM plans WHERE code = ?");
        let row = sqlx::query_as::<_, PlanRow>(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Plan::from))
    }

    pub async fn insert_plan(&self, record: NewPlan) -> Result<Plan, RepoError> {
        let id = new_id();
        let created_at = to_rfc3339(record.created_at);
        sqlx::query(
            "INSERT INTO plans (id, code, name, price_cents, currency, duration_days, \
             job_post_limit, featured_job_limit, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(&record.code)
        .bind(&record.name)
        .bind(record.price_cents)
        .bind(&record.currency)
        .bind(record.duration_days)
        .bind(record.job_post_limit)
        .bind(record.featured_job_limit)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_on_unique(err, "plan code already exists"))?;

        self.find_plan(&id).await?.ok_or(RepoError::NotFound)
    }

    pub async fn update_plan(
        &self,
        id: &str,
        update: PlanUpdate,
        now: DateTime<Utc>,
    ) -> Result<Plan, RepoError> {
        let result = sqlx::query(
            "UPDATE plans SET name = COALESCE(?, name), price_cents = COALESCE(?, price_cents), \
             duration_days = COALESCE(?, duration_days), \
             job_post_limit = COALESCE(?, job_post_limit), \
             featured_job_limit = COALESCE(?, featured_job_limit), \
             is_active = COALESCE(?, is_active), updated_at = ? WHERE id = ?",
        )
        .bind(update.name)
        .bind(update.price_cents)
        .bind(update.duration_days)
        .bind(update.job_post_limit)
        .bind(update.featured_job_limit)
        .bind(update.is_active)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_one(result.rows_affected())?;
        self.find_plan(id).await?.ok_or(RepoError::NotFound)
    }

    /// Starts an active subscription on a free plan right away, cancelling
    /// whatever was active before.
    pub async fn activate_free(
        &self,
        company_id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Subscription, RepoError> {
        let id = new_id();
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        cancel_active_in(&mut *tx, company_id, &stamp).await?;
        sqlx::query(
            "INSERT INTO subscriptions (id, company_id, plan_id, status, starts_at, ends_at, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(company_id)
        .bind(&plan.id)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(&stamp)
        .bind(to_rfc3339(plan.period_end(now)))
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *tx)
        .await?;
        let subscription = find_subscription_in(&mut *tx, &id).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Records a pending subscription on a paid plan and the payment that will
    /// activate it.
    pub async fn create_pending(
        &self,
        company_id: &str,
        plan: &Plan,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(Subscription, Payment), RepoError> {
        let subscription_id = new_id();
        let payment_id = new_id();
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO subscriptions (id, company_id, plan_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&subscription_id)
        .bind(company_id)
        .bind(&plan.id)
        .bind(SubscriptionStatus::Pending.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO payments (id, subscription_id, amount_cents, currency, status, \
             reference, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&payment_id)
        .bind(&subscription_id)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(PaymentStatus::Pending.as_str())
        .bind(reference)
        .bind(&stamp)
        .execute(&mut *tx)
        .await
        .map_err(|err| conflict_on_unique(err, "payment reference already used"))?;

        let subscription = find_subscription_in(&mut *tx, &subscription_id).await?;
        let payment = find_payment_in(&mut *tx, reference)
            .await?
            .ok_or(RepoError::NotFound)?;
        tx.commit().await?;
        Ok((subscription, payment))
    }

    /// Applies a provider callback for `reference`. Settling an already
    /// settled payment is a no-op.
    pub async fn settle_payment(
        &self,
        reference: &str,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, RepoError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        let payment = find_payment_in(&mut *tx, reference)
            .await?
            .ok_or(RepoError::NotFound)?;
        if payment.status != PaymentStatus::Pending {
            return Ok(SettlementOutcome::AlreadySettled(payment));
        }
        let subscription = find_subscription_in(&mut *tx, &payment.subscription_id).await?;

        if succeeded {
            let duration_days: i64 =
                sqlx::query_scalar("SELECT duration_days FROM plans WHERE id = ?")
                    .bind(&subscription.plan_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let ends_at = now + chrono::Duration::days(duration_days);

            sqlx::query("UPDATE payments SET status = ?, paid_at = ? WHERE id = ?")
                .bind(PaymentStatus::Succeeded.as_str())
                .bind(&stamp)
                .bind(&payment.id)
                .execute(&mut *tx)
                .await?;
            cancel_active_in(&mut *tx, &subscription.company_id, &stamp).await?;
            sqlx::query(
                "UPDATE subscriptions SET status = ?, starts_at = ?, ends_at = ?, \
                 updated_at = ? WHERE id = ?",
            )
            .bind(SubscriptionStatus::Active.as_str())
            .bind(&stamp)
            .bind(to_rfc3339(ends_at))
            .bind(&stamp)
            .bind(&subscription.id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE payments SET status = ? WHERE id = ?")
                .bind(PaymentStatus::Failed.as_str())
                .bind(&payment.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE subscriptions SET status = ?, updated_at = ? WHERE id = ?")
                .bind(SubscriptionStatus::Cancelled.as_str())
                .bind(&stamp)
                .bind(&subscription.id)
                .execute(&mut *tx)
                .await?;
        }

        let payment = find_payment_in(&mut *tx, reference)
            .await?
            .ok_or(RepoError::NotFound)?;
        let subscription = find_subscription_in(&mut *tx, &subscription.id).await?;
        tx.commit().await?;
        Ok(SettlementOutcome::Applied {
            payment,
            subscription,
        })
    }

    /// The active subscription in force at `now`, with its plan.
    pub async fn current_subscription(
        &self,
        company_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Subscription, Plan)>, RepoError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE company_id = ? AND status = 'active' AND ends_at > ? \
             ORDER BY ends_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(company_id)
            .bind(to_rfc3339(now))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let subscription = Subscription::try_from(row)?;
        let plan = self
            .find_plan(&subscription.plan_id)
            .await?
            .ok_or_else(|| RepoError::Corrupt(format!("missing plan {}", subscription.plan_id)))?;
        Ok(Some((subscription, plan)))
    }

    /// Cancels the company's active subscription immediately.
    pub async fn cancel_active(
        &self,
        company_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription, RepoError> {
        let stamp = to_rfc3339(now);
        let id: Option<String> = sqlx::query_scalar(
            "UPDATE subscriptions SET status = 'cancelled', ends_at = ?, updated_at = ? \
             WHERE company_id = ? AND status = 'active' AND ends_at > ? RETURNING id",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(company_id)
        .bind(&stamp)
        .fetch_optional(&self.pool)
        .await?;
        let id = id.ok_or(RepoError::NotFound)?;
        let mut conn = self.pool.acquire().await?;
        find_subscription_in(&mut *conn, &id).await
    }

    pub async fn list_payments(
        &self,
        company_id: &str,
        page: PageRequest,
    ) -> Result<Page<Payment>, RepoError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payments p JOIN subscriptions s ON s.id = p.subscription_id \
             WHERE s.company_id = ?",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT p.id, p.subscription_id, p.amount_cents, p.currency, p.status, p.reference, \
             p.created_at, p.paid_at \
             FROM payments p JOIN subscriptions s ON s.id = p.subscription_id \
             WHERE s.company_id = ? ORDER BY p.created_at DESC, p.id LIMIT ? OFFSET ?",
        )
        .bind(company_id)
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(Payment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    pub async fn list_subscriptions(
        &self,
        status: Option<SubscriptionStatus>,
        page: PageRequest,
    ) -> Result<Page<Subscription>, RepoError> {
        let status = status.map(SubscriptionStatus::as_str);
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE (? IS NULL OR status = ?)")
                .bind(status)
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, id LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(status)
            .bind(status)
            .bind(i64::from(page.limit()))
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(Subscription::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    /// Marks active subscriptions whose period has ended as expired.
    pub async fn expire_ended(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'expired', updated_at = ? \
             WHERE status = 'active' AND ends_at IS NOT NULL AND ends_at <= ?",
        )
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn cancel_active_in(
    conn: &mut SqliteConnection,
    company_id: &str,
    stamp: &str,
) -> Result<u64, RepoError> {
    let result = sqlx::query(
        "UPDATE subscriptions SET status = 'cancelled', updated_at = ? \
         WHERE company_id = ? AND status = 'active'",
    )
    .bind(stamp)
    .bind(company_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn find_subscription_in(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Subscription, RepoError> {
    let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?");
    let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    row.try_into()
}

async fn find_payment_in(
    conn: &mut SqliteConnection,
    reference: &str,
) -> Result<Option<Payment>, RepoError> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE reference = ?");
    let row = sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(reference)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Payment::try_from).transpose()
}
