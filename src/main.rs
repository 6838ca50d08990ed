//! ticketd entry point.
//!
//! Builds the ticket backend: database, audit log, role service, scheduler and
//! lifecycle coordinator, plus the health endpoint, then idles until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticketd::audit::AuditLog;
use ticketd::config::TicketdConfig;
use ticketd::database::Database;
use ticketd::error::Result;
use ticketd::health::{spawn_health_server, HealthState};
use ticketd::lifecycle::{autoclose_handler, TicketLifecycle};
use ticketd::roles::RoleService;
use ticketd::scheduler::TokioScheduler;
use ticketd::tickets::TicketStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize tracing; RUST_LOG controls levels (e.g. RUST_LOG=ticketd=debug)
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("ticketd starting...");

    let config = TicketdConfig::from_env()?;
    tracing::info!("Configuration loaded");

    let db = Arc::new(Database::new(&config.database_path, &config.transaction).await?);
    tracing::info!(path = %config.database_path, "Database initialized");

    spawn_health_server(config.health_port, HealthState { db: db.clone() });

    let audit = Arc::new(AuditLog::new(db.clone()));
    tracing::info!("Audit log initialized");

    #[allow(unused_mut)]
    let mut roles = RoleService::new(db.clone(), audit.clone());
    #[cfg(feature = "dev-permission-override")]
    {
        roles = roles.with_override(config.permission_override);
    }
    let roles = Arc::new(roles);
    tracing::info!("Role service initialized");

    let store = Arc::new(TicketStore::new(db.clone()));
    let scheduler = Arc::new(TokioScheduler::new());
    tracing::info!("Auto-close scheduler initialized");

    let lifecycle = Arc::new(TicketLifecycle::new(
        db,
        store,
        roles,
        audit,
        scheduler.clone(),
        config.transaction,
        Duration::from_secs(u64::from(config.default_autoclose_hours) * 3600),
    ));
    scheduler.set_handler(autoclose_handler(lifecycle.clone()));
    lifecycle.rearm_autoclose_timers().await?;
    tracing::info!("Ticket lifecycle coordinator initialized");

    tracing::info!("ticketd ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ticketd::error::TicketdError::Config(format!("signal handler: {}", e)))?;
    tracing::info!("Shutdown signal received, exiting");

    Ok(())
}
