use anyhow::Context;
use monkeysmail::bus::RedisBus;
use monkeysmail::models::{AudienceRepository, MessageRepository, WebhookRepository};
use monkeysmail::outbound::{OutboundWorker, WorkerConfig};
use monkeysmail::smtp::{SmtpConfig, SmtpSender};
use monkeysmail::webhooks::WebhookDispatcher;
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
        PgConnectOptions::from_url(&database_url)?.application_name("monkeysmail-outbound");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let bus = Arc::new(RedisBus::new_from_env_var().context("failed to connect to redis")?);
    let tracking_base =
        std::env::var("TRACKING_BASE_URL").context("TRACKING_BASE_URL must be set")?;

    let messages = Arc::new(MessageRepository::new(pool.clone()));
    let audience = Arc::new(AudienceRepository::new(pool.clone()));
    let webhooks = Arc::new(WebhookRepository::new(pool.clone()));
    let sender = Arc::new(SmtpSender::new(SmtpConfig::new_from_env()));
    let dispatcher = WebhookDispatcher::new(webhooks, bus.clone());

    let shutdown = CancellationToken::new();
    let worker = Arc::new(OutboundWorker::new(
        bus.clone(),
        messages,
        audience,
        sender,
        dispatcher,
        bus,
        WorkerConfig::new(consumer_name(), tracking_base),
    ));
    worker.spawn(shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give the worker the opportunity to finish its entry
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
