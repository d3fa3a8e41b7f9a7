use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::Role;
use crate::application::ApplicationStatus;

/// Registered account. The password hash never leaves the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Active and not soft-deleted.
    pub fn can_sign_in(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    pub fn belongs_to(&self, company_id: &str) -> bool {
        self.company_id.as_deref() == Some(company_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

string_enum! {
    pub enum EmploymentType {
        FullTime => "full_time",
        PartTime => "part_time",
        Contract => "contract",
        Internship => "internship",
        Temporary => "temporary",
    }
}

string_enum! {
    pub enum ExperienceLevel {
        Entry => "entry",
        Junior => "junior",
        Mid => "mid",
        Senior => "senior",
        Lead => "lead",
    }
}

string_enum! {
    pub enum JobStatus {
        Draft => "draft",
        Published => "published",
        Closed => "closed",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub company_id: String,
    pub posted_by: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    pub location: String,
    pub employment_type: EmploymentType,
    pub experience_level: ExperienceLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_max: Option<i64>,
    pub currency: String,
    pub is_remote: bool,
    pub status: JobStatus,
    pub is_featured: bool,
    pub views_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Published, not deleted and still accepting applications at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Published
            && self.deleted_at.is_none()
            && self.deadline.map(|deadline| deadline > now).unwrap_or(true)
    }

    /// Human readable salary band.
    pub fn salary_range(&self) -> String {
        match (self.salary_min, self.salary_max) {
            (Some(min), Some(max)) => format!("{min} - {max} {}", self.currency),
            (Some(min), None) => format!("From {min} {}", self.currency),
            (None, Some(max)) => format!("Up to {max} {}", self.currency),
            (None, None) => "Negotiable".to_string(),
        }
    }
}

/// Returns `true` when the pair is a valid salary band.
pub fn salary_band_is_valid(min: Option<i64>, max: Option<i64>) -> bool {
    match (min, max) {
        (Some(min), _) if min < 0 => false,
        (_, Some(max)) if max < 0 => false,
        (Some(min), Some(max)) => min <= max,
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub job_id: String,
    pub applicant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cv_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_letter: Option<String>,
    pub status: ApplicationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employer_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cv {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub skills: Vec<String>,
    pub experience_years: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub education: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

string_enum! {
    pub enum NotificationKind {
        ApplicationReceived => "application_received",
        ApplicationStatusChanged => "application_status_changed",
        NewMessage => "new_message",
        System => "system",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Summary of the thread between the caller and one counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub counterpart_id: String,
    pub counterpart_name: String,
    pub last_message: Message,
    pub unread_count: i64,
}

string_enum! {
    pub enum PostStatus {
        Draft => "draft",
        Published => "published",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogPost {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub content: String,
    pub status: PostStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Code of the plan every company falls back to.
pub const FREE_PLAN_CODE: &str = "free";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub duration_days: i64,
    pub job_post_limit: i64,
    pub featured_job_limit: i64,
    pub is_active: bool,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    pub fn period_end(&self, starts_at: DateTime<Utc>) -> DateTime<Utc> {
        starts_at + Duration::days(self.duration_days)
    }

    /// Whether a company with `published` live jobs may publish one more.
    pub fn allows_publish(&self, published: i64) -> bool {
        published < self.job_post_limit
    }

    pub fn allows_featured(&self, featured: i64) -> bool {
        featured < self.featured_job_limit
    }
}

string_enum! {
    pub enum SubscriptionStatus {
        Pending => "pending",
        Active => "active",
        Cancelled => "cancelled",
        Expired => "expired",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub company_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active and inside its paid period at `now`.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.ends_at.map(|end| end > now).unwrap_or(false)
    }
}

string_enum! {
    pub enum PaymentStatus {
        Pending => "pending",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub subscription_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    pub owner_id: String,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    #[serde(skip)]
    pub stored_name: String,
    pub created_at: DateTime<Utc>,
}

impl Upload {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}
