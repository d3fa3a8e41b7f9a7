use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use jobboard_core::access::Role;
use jobboard_core::types::{Company, Cv, EmploymentType, ExperienceLevel, Job, User};
use jobboard_storage::{Database, NewCompany, NewCv, NewJob, NewUser};
use jobboard_util::{AppConfig, Environment, MailConfig, PasswordHashConfig};

use crate::auth::PermissionRegistry;
use crate::mail::{Mailer, SentMail};
use crate::router::{app_router, AppState, Clock};
use crate::telemetry;

pub const PASSWORD: &str = "password123";
pub const WEBHOOK_SECRET: &str = "webhook-secret";

pub fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn test_config(upload_dir: PathBuf) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".parse().expect("bind addr"),
        environment: Environment::Test,
        database_url: "sqlite::memory:".to_string(),
        database_max_connections: 5,
        jwt_secret: "test-jwt-secret".to_string(),
        access_token_ttl: StdDuration::from_secs(900),
        refresh_token_ttl_days: 30,
        password_reset_ttl_minutes: 60,
        password_hash: PasswordHashConfig {
            memory_kib: 1024,
            iterations: 1,
        },
        upload_dir,
        upload_max_bytes: 1024,
        payment_webhook_secret: WEBHOOK_SECRET.to_string(),
        notify_heartbeat_secs: 1,
        mail: MailConfig {
            from: "Job Board <no-reply@jobboard.local>".to_string(),
            smtp_host: None,
            smtp_port: 25,
            smtp_username: None,
            smtp_password: None,
            frontend_url: "http://frontend.test".to_string(),
        },
        admin: None,
        maintenance_interval: StdDuration::from_secs(60),
    }
}

/// Application wired to an in-memory database, a movable clock and a
/// capturing mailer.
pub struct TestApp {
    pub state: AppState,
    outbox: Arc<Mutex<Vec<SentMail>>>,
    clock: Arc<Mutex<DateTime<Utc>>>,
    uploads: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let uploads = tempfile::tempdir().expect("tempdir");
        let config = test_config(uploads.path().to_path_buf());

        let database = Database::connect(&config.database_url)
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let permissions = PermissionRegistry::load(&database)
            .await
            .expect("permissions");
        let (mailer, outbox) = Mailer::memory();
        let metrics = telemetry::init_metrics().expect("metrics");

        let clock = Arc::new(Mutex::new(ts("2024-06-01T12:00:00Z")));
        let shared = clock.clone();
        let app_clock: Clock = Arc::new(move || *shared.lock().expect("clock"));

        let state = AppState::new(metrics, database, &config, permissions, mailer)
            .expect("state")
            .with_clock(app_clock);

        Self {
            state,
            outbox,
            clock,
            uploads,
        }
    }

    pub fn db(&self) -> &Database {
        self.state.storage()
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock().expect("clock")
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.clock.lock().expect("clock");
        *now += by;
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.uploads.path().to_path_buf()
    }

    pub fn sent_mail(&self) -> Vec<SentMail> {
        self.outbox.lock().expect("outbox").clone()
    }

    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router().oneshot(request).await.expect("response")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self.send(request).await;
        let status = response.status();
        (status, read_json(response).await)
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.request(Method::GET, uri, token, None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, token, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.request(Method::PATCH, uri, token, Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, token, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, token, None).await
    }

    pub async fn raw_get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty()).expect("request");
        let response = self.send(request).await;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, bytes.to_vec())
    }

    pub fn token_for(&self, user: &User) -> String {
        self.state.tokens().issue(user, self.now()).expect("token")
    }

    /// Inserts an active user with [`PASSWORD`] and returns it with an access token.
    pub async fn user(&self, email: &str, role: Role) -> (User, String) {
        let password_hash = self.state.passwords().hash(PASSWORD).await.expect("hash");
        let user = self
            .db()
            .users()
            .insert(NewUser {
                email: email.to_string(),
                password_hash,
                full_name: email.split('@').next().unwrap_or("user").to_string(),
                role,
                created_at: self.now(),
            })
            .await
            .expect("insert user");
        let token = self.token_for(&user);
        (user, token)
    }

    pub async fn admin(&self) -> (User, String) {
        self.user("admin@example.com", Role::Admin).await
    }

    /// Employer owning a fresh company.
    pub async fn employer(&self, email: &str, company: &str) -> (User, String, Company) {
        let (user, _) = self.user(email, Role::Employer).await;
        let company = self
            .db()
            .companies()
            .create(NewCompany {
                owner_id: user.id.clone(),
                name: company.to_string(),
                description: None,
                website: None,
                industry: Some("software".to_string()),
                size: None,
                location: Some("Berlin".to_string()),
                logo_url: None,
                created_at: self.now(),
            })
            .await
            .expect("insert company");
        let user = self
            .db()
            .users()
            .find_by_id(&user.id)
            .await
            .expect("reload")
            .expect("user");
        let token = self.token_for(&user);
        (user, token, company)
    }

    /// HR user linked to `company`.
    pub async fn hr(&self, email: &str, company: &Company) -> (User, String) {
        let (user, _) = self.user(email, Role::Hr).await;
        self.db()
            .companies()
            .add_member(&company.id, &user.id, self.now())
            .await
            .expect("add member");
        let user = self
            .db()
            .users()
            .find_by_id(&user.id)
            .await
            .expect("reload")
            .expect("user");
        let token = self.token_for(&user);
        (user, token)
    }

    pub async fn cv(&self, owner: &User, title: &str) -> Cv {
        self.db()
            .cvs()
            .insert(NewCv {
                user_id: owner.id.clone(),
                title: title.to_string(),
                summary: None,
                skills: vec!["rust".to_string(), "sql".to_string()],
                experience_years: 5,
                education: None,
                upload_id: None,
                created_at: self.now(),
            })
            .await
            .expect("insert cv")
    }

    pub async fn draft_job(&self, company: &Company, poster: &User, title: &str) -> Job {
        self.db()
            .jobs()
            .insert(NewJob {
                company_id: company.id.clone(),
                posted_by: poster.id.clone(),
                title: title.to_string(),
                description: "Build reliable services".to_string(),
                requirements: Some("Rust".to_string()),
                location: "Berlin".to_string(),
                employment_type: EmploymentType::FullTime,
                experience_level: ExperienceLevel::Senior,
                salary_min: Some(60_000),
                salary_max: Some(80_000),
                currency: "EUR".to_string(),
                is_remote: false,
                is_featured: false,
                deadline: None,
                created_at: self.now(),
            })
            .await
            .expect("insert job")
    }

    pub async fn published_job(&self, company: &Company, poster: &User, title: &str) -> Job {
        let job = self.draft_job(company, poster, title).await;
        self.db()
            .jobs()
            .publish(&job.id, self.now())
            .await
            .expect("publish job")
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}
