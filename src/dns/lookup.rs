//! DNS and HTTPS ports for domain verification. Production resolution goes
//! through hickory over DoT; the static implementations back the tests.

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::Resolver;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no records")]
    NoRecords,
    #[error("dns failure: {0}")]
    Dns(String),
}

#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// TXT record strings with character chunks already joined.
    async fn txt(&self, name: &str) -> Result<Vec<String>, LookupError>;
    async fn mx(&self, name: &str) -> Result<Vec<(String, u16)>, LookupError>;
    async fn cname(&self, name: &str) -> Result<Option<String>, LookupError>;
}

#[derive(Debug, Clone)]
pub struct HttpBody {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// GET with certificate verification enabled.
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpBody, String>;
}

#[derive(Clone)]
pub struct HickoryLookup {
    resolver: Resolver<TokioConnectionProvider>,
}

impl Default for HickoryLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl HickoryLookup {
    pub fn new() -> Self {
        let mut options = ResolverOpts::default();
        options.timeout = Duration::from_secs(5);
        options.attempts = 2;

        let mut config = ResolverConfig::new();
        // Quad9 and Cloudflare over TLS
        for (addr, name) in [
            ("9.9.9.9:853", "dns.quad9.net"),
            ("149.112.112.112:853", "dns.quad9.net"),
            ("1.1.1.1:853", "cloudflare-dns.com"),
        ] {
            config.add_name_server(NameServerConfig {
                socket_addr: addr.parse().expect("valid resolver address"),
                protocol: Protocol::Tls,
                tls_dns_name: Some(name.to_string()),
                http_endpoint: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }

        Self {
            resolver: Resolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(options)
                .build(),
        }
    }

    fn fqdn(name: &str) -> String {
        let name = name.trim_matches('.');
        format!("{name}.")
    }
}

fn map_error(err: hickory_resolver::ResolveError) -> LookupError {
    let text = err.to_string();
    if text.contains("no record") {
        LookupError::NoRecords
    } else {
        LookupError::Dns(text)
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        trace!(name, "TXT lookup");
        let lookup = self
            .resolver
            .txt_lookup(Self::fqdn(name))
            .await
            .map_err(map_error)?;
        Ok(lookup
            .iter()
            .map(|txt| {
                let bytes: Vec<u8> = txt.txt_data().iter().flatten().copied().collect();
                String::from_utf8_lossy(&bytes).into_owned()
            })
            .collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<(String, u16)>, LookupError> {
        trace!(name, "MX lookup");
        let lookup = self
            .resolver
            .mx_lookup(Self::fqdn(name))
            .await
            .map_err(map_error)?;
        Ok(lookup
            .iter()
            .map(|mx| (mx.exchange().to_utf8(), mx.preference()))
            .collect())
    }

    async fn cname(&self, name: &str) -> Result<Option<String>, LookupError> {
        trace!(name, "CNAME lookup");
        let lookup = self
            .resolver
            .lookup(Self::fqdn(name), RecordType::CNAME)
            .await
            .map_err(map_error)?;
        Ok(lookup.iter().find_map(|rdata| match rdata {
            RData::CNAME(target) => Some(target.to_utf8()),
            _ => None,
        }))
    }
}

pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl Default for ReqwestFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(3))
                .build()
                .expect("could not build HTTPS client"),
        }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpBody, String> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(HttpBody { status, body })
    }
}

/// Fixed record set for tests, keyed by name without the trailing dot.
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    pub txt: HashMap<String, Vec<String>>,
    pub mx: HashMap<String, Vec<(String, u16)>>,
    pub cname: HashMap<String, String>,
}

impl StaticLookup {
    fn key(name: &str) -> String {
        name.trim_end_matches('.').to_ascii_lowercase()
    }

    pub fn with_txt(mut self, name: &str, values: &[&str]) -> Self {
        self.txt.insert(
            Self::key(name),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_mx(mut self, name: &str, values: &[(&str, u16)]) -> Self {
        self.mx.insert(
            Self::key(name),
            values.iter().map(|(h, p)| (h.to_string(), *p)).collect(),
        );
        self
    }

    pub fn with_cname(mut self, name: &str, target: &str) -> Self {
        self.cname.insert(Self::key(name), target.to_string());
        self
    }
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        self.txt
            .get(&Self::key(name))
            .cloned()
            .ok_or(LookupError::NoRecords)
    }

    async fn mx(&self, name: &str) -> Result<Vec<(String, u16)>, LookupError> {
        self.mx
            .get(&Self::key(name))
            .cloned()
            .ok_or(LookupError::NoRecords)
    }

    async fn cname(&self, name: &str) -> Result<Option<String>, LookupError> {
        Ok(self.cname.get(&Self::key(name)).cloned())
    }
}

#[derive(Debug, Default)]
pub struct StaticFetch {
    pub responses: HashMap<String, (u16, String)>,
}

impl StaticFetch {
    pub fn with(mut self, url: &str, status: u16, body: &str) -> Self {
        self.responses
            .insert(url.to_string(), (status, body.to_string()));
        self
    }
}

#[async_trait]
impl HttpFetch for StaticFetch {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpBody, String> {
        match self.responses.get(url) {
            Some((status, body)) => Ok(HttpBody {
                status: *status,
                body: body.clone(),
            }),
            None => Err(format!("connection refused: {url}")),
        }
    }
}
