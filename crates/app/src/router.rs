use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use jobboard_storage::Database;
use jobboard_util::AppConfig;

use crate::auth::{HasherConfigError, Passwords, PermissionRegistry, TokenService};
use crate::mail::Mailer;
use crate::notify::{NotificationHub, Notifier};
use crate::{api, payments, telemetry};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Values resolved once from configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub refresh_ttl_days: i64,
    pub reset_ttl_minutes: i64,
    pub upload_dir: PathBuf,
    pub upload_max_bytes: usize,
    pub webhook_secret: Arc<[u8]>,
    pub heartbeat: Duration,
    pub frontend_url: String,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Clock,
    tokens: TokenService,
    passwords: Passwords,
    permissions: PermissionRegistry,
    notifier: Notifier,
    mailer: Mailer,
    settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        config: &AppConfig,
        permissions: PermissionRegistry,
        mailer: Mailer,
    ) -> Result<Self, HasherConfigError> {
        let clock: Clock = Arc::new(Utc::now);
        let notifier = Notifier::new(storage.clone(), NotificationHub::new(), clock.clone());
        Ok(Self {
            metrics,
            tokens: TokenService::new(config.jwt_secret.as_bytes(), config.access_token_ttl),
            passwords: Passwords::new(config.password_hash)?,
            storage,
            clock,
            permissions,
            notifier,
            mailer,
            settings: Arc::new(Settings {
                refresh_ttl_days: config.refresh_token_ttl_days,
                reset_ttl_minutes: config.password_reset_ttl_minutes,
                upload_dir: config.upload_dir.clone(),
                upload_max_bytes: config.upload_max_bytes,
                webhook_secret: Arc::from(config.payment_webhook_secret.as_bytes()),
                heartbeat: Duration::from_secs(config.notify_heartbeat_secs.max(1)),
                frontend_url: config.mail.frontend_url.trim_end_matches('/').to_string(),
            }),
        })
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.notifier = Notifier::new(
            self.storage.clone(),
            self.notifier.hub().clone(),
            clock.clone(),
        );
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn passwords(&self) -> &Passwords {
        &self.passwords
    }

    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .merge(api::routes())
        .merge(payments::routes())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = TestApp::new().await;
        let (status, _) = app.get("/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = TestApp::new().await;
        let (status, body) = app.raw_get("/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn metrics_describe_busy_timeouts() {
        let app = TestApp::new().await;
        metrics::counter!("db_busy_total", "op" => "close_expired_jobs").increment(1);
        let (status, body) = app.raw_get("/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).expect("utf-8");
        assert!(body.contains("# HELP db_busy_total"));
        assert!(body.contains("db_busy_total{op=\"close_expired_jobs\"}"));
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let app = TestApp::new().await;
        let (status, _) = app.get("/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
