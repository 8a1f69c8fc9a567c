use anyhow::Context;
use monkeysmail::bus::RedisBus;
use monkeysmail::dkim::{DkimRegistrar, KeyService, TableSync};
use monkeysmail::dns::{DomainVerifier, HickoryLookup, ReqwestFetch};
use monkeysmail::models::{DomainRepository, WebhookRepository};
use monkeysmail::periodically::{Periodically, run_periodically};
use monkeysmail::webhooks::{
    DeliveryWorker, DeliveryWorkerConfig, HttpTransport, WebhookDispatcher,
};
use monkeysmail::{consumer_name, init_tracing, shutdown_signal};
use chrono::Duration as ChronoDuration;
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
        PgConnectOptions::from_url(&database_url)?.application_name("monkeysmail-webhooks");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let bus = Arc::new(RedisBus::new_from_env_var().context("failed to connect to redis")?);
    let webhooks = Arc::new(WebhookRepository::new(pool.clone()));
    let domains = Arc::new(DomainRepository::new(pool));

    let shutdown = CancellationToken::new();

    let worker = Arc::new(DeliveryWorker::new(
        bus.clone(),
        webhooks.clone(),
        Arc::new(HttpTransport::new(10)),
        DeliveryWorkerConfig::new(consumer_name()),
    ));
    worker.spawn(shutdown.clone());

    let verifier = Arc::new(DomainVerifier::new(
        Arc::new(HickoryLookup::new()),
        Arc::new(ReqwestFetch::new()),
        domains.clone(),
    ));
    let table_dir =
        std::env::var("DKIM_TABLE_DIR").unwrap_or_else(|_| "/etc/opendkim".to_string());
    let registrar = Arc::new(DkimRegistrar::new(
        KeyService::new_from_env(),
        TableSync::new(
            format!("{table_dir}/key.table"),
            format!("{table_dir}/signing.table"),
            format!("{table_dir}/trusted.hosts"),
        ),
        domains.clone(),
    ));
    let periodically = Arc::new(Periodically::new(
        WebhookDispatcher::new(webhooks, bus),
        verifier,
        registrar,
        domains,
    ));

    let redrive = periodically.clone();
    run_periodically(
        move || {
            let redrive = redrive.clone();
            async move { redrive.redrive_webhooks().await }
        },
        ChronoDuration::seconds(30),
        shutdown.clone(),
    );
    let recheck = periodically.clone();
    run_periodically(
        move || {
            let recheck = recheck.clone();
            async move { recheck.recheck_pending_domains().await }
        },
        ChronoDuration::minutes(15),
        shutdown.clone(),
    );
    let dkim_sync = periodically.clone();
    run_periodically(
        move || {
            let dkim_sync = dkim_sync.clone();
            async move { dkim_sync.sync_dkim_tables().await }
        },
        ChronoDuration::minutes(10),
        shutdown.clone(),
    );

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
