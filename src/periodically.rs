//! Recurring maintenance: re-driving due webhook deliveries and re-checking
//! domains that have not verified yet.

use crate::dkim::DkimRegistrar;
use crate::dns::DomainVerifier;
use crate::models::{self, DomainStatus};
use crate::store::DomainStore;
use crate::webhooks::WebhookDispatcher;
use chrono::Duration;
use std::error::Error;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub fn run_periodically<F, E, Fut>(task: F, period: Duration, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + 'static,
    E: Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        loop {
            select!(
                _ = cancel.cancelled() => {
                    info!("periodic task cancelled");
                    return;
                },
                _ = tokio::time::sleep(period.to_std().expect("non-negative period")) => {
                    if let Err(err) = task().await {
                        error!("periodic task failed: {err}");
                    }
                }
            )
        }
    });
}

pub struct Periodically {
    dispatcher: WebhookDispatcher,
    verifier: Arc<DomainVerifier>,
    registrar: Arc<DkimRegistrar>,
    domains: Arc<dyn DomainStore>,
}

impl Periodically {
    pub fn new(
        dispatcher: WebhookDispatcher,
        verifier: Arc<DomainVerifier>,
        registrar: Arc<DkimRegistrar>,
        domains: Arc<dyn DomainStore>,
    ) -> Self {
        Self {
            dispatcher,
            verifier,
            registrar,
            domains,
        }
    }

    /// Puts ledger rows whose retry time has come back on the delivery
    /// stream.
    pub async fn redrive_webhooks(&self) -> Result<(), models::Error> {
        let redriven = self.dispatcher.redrive_due(100).await?;
        if redriven > 0 {
            debug!(redriven, "webhook deliveries re-driven");
        }
        Ok(())
    }

    /// Re-verifies pending domains so DNS fixes get picked up without a
    /// manual trigger.
    pub async fn recheck_pending_domains(&self) -> Result<(), models::Error> {
        for domain in self.domains.domains_with_status(DomainStatus::Pending).await? {
            if let Err(err) = self.verifier.verify_domain(domain.id).await {
                error!(domain = %domain.name, "re-verification failed: {err}");
            }
        }
        Ok(())
    }

    /// Rewrites the milter tables from the active-key set; row errors are
    /// logged but never abort the pass.
    pub async fn sync_dkim_tables(&self) -> Result<(), models::Error> {
        let report = self.registrar.sync_tables().await?;
        for row_error in &report.errors {
            error!("DKIM table row skipped: {row_error}");
        }
        Ok(())
    }
}
