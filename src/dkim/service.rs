//! Ties key material, the key rows, and the milter tables together.

use crate::dkim::keys::{DkimKeyMaterial, KeyService};
use crate::dkim::registrar::{SigningEntry, SyncReport, TableSync};
use crate::models::{DkimKey, DomainId, Error, NewDkimKey};
use crate::store::DomainStore;
use std::sync::Arc;
use tracing::info;

pub struct DkimRegistrar {
    keys: KeyService,
    tables: TableSync,
    store: Arc<dyn DomainStore>,
}

impl DkimRegistrar {
    pub fn new(keys: KeyService, tables: TableSync, store: Arc<dyn DomainStore>) -> Self {
        Self {
            keys,
            tables,
            store,
        }
    }

    /// Idempotent: repeated calls return the same TXT value and private key
    /// path. A changed key file rotates the active row.
    pub async fn ensure_key_for_domain(
        &self,
        domain_id: DomainId,
        selector: &str,
    ) -> Result<(DkimKey, DkimKeyMaterial), Error> {
        let domain = self
            .store
            .domain(domain_id)
            .await?
            .ok_or(Error::NotFound("domain"))?;

        let material = self.keys.ensure_key(&domain.name, selector)?;

        let existing = self
            .store
            .active_dkim_key(domain_id, &material.selector)
            .await?;
        let key = match existing {
            Some(key) if key.txt_value == material.txt_value => key,
            _ => {
                info!(
                    domain = %domain.name,
                    selector = %material.selector,
                    "registering DKIM key"
                );
                self.store
                    .insert_dkim_key(NewDkimKey {
                        domain_id,
                        selector: material.selector.clone(),
                        public_pem: material.public_pem.clone(),
                        private_key_path: material.private_key_path.display().to_string(),
                        txt_value: material.txt_value.clone(),
                    })
                    .await?
            }
        };

        Ok((key, material))
    }

    /// Rewrites the milter tables from the full active-key set and signals
    /// the milter to reload.
    pub async fn sync_tables(&self) -> Result<SyncReport, Error> {
        let entries: Vec<SigningEntry> = self
            .store
            .active_dkim_keys()
            .await?
            .into_iter()
            .map(|(domain, key)| SigningEntry {
                domain,
                selector: key.selector,
                key_path: key.private_key_path.into(),
            })
            .collect();
        self.tables.sync_tables(&entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Domain, DomainExpectations, DomainStatus};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn registrar(dir: &TempDir, store: Arc<MemoryStore>) -> DkimRegistrar {
        let mut tables = TableSync::new(
            dir.path().join("tables/key.table"),
            dir.path().join("tables/signing.table"),
            dir.path().join("tables/trusted.hosts"),
        );
        tables.signal_milter = false;
        DkimRegistrar::new(KeyService::new(dir.path().join("keys")), tables, store)
    }

    fn seed_domain(store: &MemoryStore) {
        store.insert_domain(Domain {
            id: 1.into(),
            tenant_id: 1.into(),
            name: "example.com".to_string(),
            status: DomainStatus::Pending,
            expectations: DomainExpectations::default(),
            require_tls: false,
            arc_sign: false,
            bimi_enabled: false,
            last_checked_at: None,
            verified_at: None,
            verification_report: None,
            created_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn ensure_key_is_idempotent_at_the_row_level() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed_domain(&store);
        let registrar = registrar(&dir, store.clone());

        let (first, material) = registrar
            .ensure_key_for_domain(1.into(), "mail")
            .await
            .unwrap();
        let (second, _) = registrar
            .ensure_key_for_domain(1.into(), "mail")
            .await
            .unwrap();
        assert_eq!(first.id, second.id, "no new row for an unchanged key");
        assert_eq!(first.txt_value, material.txt_value);
        assert!(material.private_key_path.exists());
    }

    #[tokio::test]
    async fn sync_tables_reflects_registered_keys() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed_domain(&store);
        let registrar = registrar(&dir, store.clone());

        registrar
            .ensure_key_for_domain(1.into(), "mail")
            .await
            .unwrap();
        let report = registrar.sync_tables().await.unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(report.key_rows, 1);

        let signing =
            fs::read_to_string(dir.path().join("tables/signing.table")).unwrap();
        assert!(signing.contains("*@example.com example.com.mail"));
        assert!(signing.contains("*@*.example.com example.com.mail"));
    }
}
