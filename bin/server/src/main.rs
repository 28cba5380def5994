use mir_server::{
    config::ServerConfig, db::PgSessionStorage, error::ServerError, runtime::Runtime,
    summarizer::HttpSummarizer,
};
use rootcause::Report;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Report<ServerError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().map_err(|e| ServerError::Config {
        details: e.to_string(),
    })?;
    tracing::info!(
        summarizer = ?config.summarizer,
        sessions = ?config.sessions,
        "Loaded configuration"
    );

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| ServerError::Database {
            details: e.to_string(),
        })?;

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| ServerError::Migration {
            details: e.to_string(),
        })?;

    let summarizer = HttpSummarizer::new(&config.summarizer).map_err(|e| {
        e.context(ServerError::Startup {
            component: "summarizer",
        })
    })?;

    let runtime = Runtime::start(
        &config.sessions,
        &config.queues,
        Arc::new(PgSessionStorage::new(db_pool.clone())),
        Arc::new(summarizer),
    )?;

    // The reply handlers of the messaging transport drive `runtime.service()`.
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down...");
    runtime.shutdown().await;
    db_pool.close().await;
    Ok(())
}
