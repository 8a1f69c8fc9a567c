use anyhow::Context;
use monkeysmail::bus::RedisBus;
use monkeysmail::models::AudienceRepository;
use monkeysmail::segments::{SegmentBuildService, SegmentOrchestrator, SegmentWorkerConfig};
use monkeysmail::{consumer_name, init_tracing, shutdown_signal};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options =
        PgConnectOptions::from_url(&database_url)?.application_name("monkeysmail-segments");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let bus = Arc::new(RedisBus::new_from_env_var().context("failed to connect to redis")?);
    let audience = Arc::new(AudienceRepository::new(pool));

    let shutdown = CancellationToken::new();
    let orchestrator = Arc::new(SegmentOrchestrator::new(
        bus.clone(),
        bus,
        SegmentBuildService::new(audience),
        SegmentWorkerConfig::new(consumer_name()),
    ));
    orchestrator.spawn(shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
