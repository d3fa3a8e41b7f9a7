use std::{env, fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use super::server_bind_address;

const DEV_JWT_SECRET: &str = "dev-only-jwt-secret-change-me";
const DEV_WEBHOOK_SECRET: &str = "dev-only-webhook-secret";
const DEFAULT_DATABASE_URL: &str = "sqlite://jobboard.db?mode=rwc";
const DEFAULT_MAIL_FROM: &str = "Job Board <no-reply@jobboard.local>";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Argon2 cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHashConfig {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for PasswordHashConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
        }
    }
}

/// Outgoing mail settings. SMTP delivery is enabled when `smtp_host` is set.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub from: String,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub frontend_url: String,
}

/// Bootstrap credentials for the first administrator account.
#[derive(Debug, Clone)]
pub struct AdminBootstrap {
    pub email: String,
    pub password: String,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl_days: i64,
    pub password_reset_ttl_minutes: i64,
    pub password_hash: PasswordHashConfig,
    pub upload_dir: PathBuf,
    pub upload_max_bytes: usize,
    pub payment_webhook_secret: String,
    pub notify_heartbeat_secs: u64,
    pub mail: MailConfig,
    pub admin: Option<AdminBootstrap>,
    pub maintenance_interval: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let jwt_secret = secret_var("JWT_SECRET", environment, DEV_JWT_SECRET)?;
        let payment_webhook_secret =
            secret_var("PAYMENT_WEBHOOK_SECRET", environment, DEV_WEBHOOK_SECRET)?;

        let admin = match (optional_var("ADMIN_EMAIL"), optional_var("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminBootstrap { email, password }),
            _ => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5)?,
            jwt_secret,
            access_token_ttl: Duration::from_secs(parse_var("ACCESS_TOKEN_TTL_SECS", 3600)?),
            refresh_token_ttl_days: parse_var("REFRESH_TOKEN_TTL_DAYS", 30)?,
            password_reset_ttl_minutes: parse_var("PASSWORD_RESET_TTL_MINUTES", 60)?,
            password_hash: PasswordHashConfig {
                memory_kib: parse_var("PASSWORD_HASH_MEMORY_KIB", 19_456)?,
                iterations: parse_var("PASSWORD_HASH_ITERATIONS", 2)?,
            },
            upload_dir: PathBuf::from(
                env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string()),
            ),
            upload_max_bytes: parse_var("UPLOAD_MAX_BYTES", 5 * 1024 * 1024)?,
            payment_webhook_secret,
            notify_heartbeat_secs: parse_var("NOTIFY_HEARTBEAT_SECS", 25)?,
            mail: MailConfig {
                from: env::var("MAIL_FROM").unwrap_or_else(|_| DEFAULT_MAIL_FROM.to_string()),
                smtp_host: optional_var("SMTP_HOST"),
                smtp_port: parse_var("SMTP_PORT", 25)?,
                smtp_username: optional_var("SMTP_USERNAME"),
                smtp_password: optional_var("SMTP_PASSWORD"),
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            admin,
            maintenance_interval: Duration::from_secs(parse_var(
                "MAINTENANCE_INTERVAL_SECS",
                300,
            )?),
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

fn secret_var(
    name: &'static str,
    environment: Environment,
    fallback: &str,
) -> Result<String, ConfigError> {
    match optional_var(name) {
        Some(value) => Ok(value),
        None if environment.is_production() => Err(ConfigError::MissingSecret(name)),
        None => Ok(fallback.to_string()),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue { name: &'static str, value: String },
    MissingSecret(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
            Self::MissingSecret(name) => write!(f, "{name} must be set in production"),
        }
    }
}

impl std::error::Error for ConfigError {}
