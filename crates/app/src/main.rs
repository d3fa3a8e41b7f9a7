mod api;
mod auth;
mod error;
mod mail;
mod maintenance;
mod notify;
mod payments;
mod router;
mod telemetry;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;

use tracing::info;

use jobboard_storage::Database;
use jobboard_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database =
        Database::connect_with(&config.database_url, config.database_max_connections).await?;
    database.run_migrations().await?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let permissions = auth::PermissionRegistry::load(&database).await?;
    let mailer = mail::Mailer::from_config(&config.mail)?;
    let state = router::AppState::new(metrics, database.clone(), &config, permissions, mailer)?;

    if let Some(admin) = &config.admin {
        auth::ensure_admin(&state, admin).await?;
    }
    maintenance::MaintenanceWorker::new(database, config.maintenance_interval).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
