//! Resolves a domain's expected records and compares them field by field,
//! producing a structured report and flipping the domain status.

use crate::dns::lookup::{DnsLookup, HttpFetch, LookupError};
use crate::models::{Domain, DomainExpectations, DomainId, DomainStatus, Error, MxRecord};
use crate::store::DomainStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info};

const POLICY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

static STS_TXT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^v=STSv1;\s*id=").expect("valid STS pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl CheckResult {
    fn pass(expected: impl Into<Option<String>>, found: impl Into<Option<String>>) -> Self {
        Self {
            status: CheckStatus::Pass,
            expected: expected.into(),
            found: found.into(),
            errors: Vec::new(),
        }
    }

    fn fail(
        expected: impl Into<Option<String>>,
        found: impl Into<Option<String>>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: CheckStatus::Fail,
            expected: expected.into(),
            found: found.into(),
            errors: vec![error.into()],
        }
    }

    fn skipped() -> Self {
        Self {
            status: CheckStatus::Skipped,
            expected: None,
            found: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerificationReport {
    pub checked_at: DateTime<Utc>,
    pub verification: CheckResult,
    pub spf: CheckResult,
    pub dmarc: CheckResult,
    pub mx: CheckResult,
    pub dkim: CheckResult,
    pub tls_rpt: CheckResult,
    pub mta_sts: CheckResult,
    pub summary: Summary,
}

impl VerificationReport {
    fn checks(&self) -> [&CheckResult; 7] {
        [
            &self.verification,
            &self.spf,
            &self.dmarc,
            &self.mx,
            &self.dkim,
            &self.tls_rpt,
            &self.mta_sts,
        ]
    }

    /// Every required (non-skipped) check passed, and at least one ran.
    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0 && self.summary.passed > 0
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_txt(s: &str) -> String {
    collapse_ws(s.trim().trim_matches('"'))
}

fn strip_ws_lower(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn with_trailing_dot(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    if host.ends_with('.') {
        host
    } else {
        format!("{host}.")
    }
}

fn dkim_p_value(txt: &str) -> Option<String> {
    txt.split(';')
        .filter_map(|field| field.trim().split_once('='))
        .find(|(key, _)| key.trim() == "p")
        .map(|(_, value)| value.chars().filter(|c| !c.is_whitespace()).collect())
}

pub struct DomainVerifier {
    lookup: Arc<dyn DnsLookup>,
    http: Arc<dyn HttpFetch>,
    store: Arc<dyn DomainStore>,
}

impl DomainVerifier {
    pub fn new(
        lookup: Arc<dyn DnsLookup>,
        http: Arc<dyn HttpFetch>,
        store: Arc<dyn DomainStore>,
    ) -> Self {
        Self {
            lookup,
            http,
            store,
        }
    }

    /// Runs every check, persists the report, and flips the status:
    /// `active` iff all required checks pass, otherwise back to `pending`.
    pub async fn verify_domain(&self, id: DomainId) -> Result<VerificationReport, Error> {
        let domain = self.store.domain(id).await?.ok_or(Error::NotFound("domain"))?;
        let report = self.verify(&domain).await;

        let status = if report.all_passed() {
            DomainStatus::Active
        } else {
            DomainStatus::Pending
        };
        let verified_at = report.all_passed().then(|| report.checked_at);

        self.store
            .update_verification(
                id,
                status,
                serde_json::to_value(&report)?,
                verified_at,
                report.checked_at,
            )
            .await?;

        info!(
            domain = %domain.name,
            passed = report.summary.passed,
            failed = report.summary.failed,
            "domain verification finished"
        );
        Ok(report)
    }

    pub async fn verify(&self, domain: &Domain) -> VerificationReport {
        let apex = domain.name.trim_matches('.');
        let exp = &domain.expectations;

        let mut report = VerificationReport {
            checked_at: Utc::now(),
            verification: self.check_verification_txt(exp).await,
            spf: self.check_spf(apex, exp).await,
            dmarc: self.check_dmarc(apex, exp).await,
            mx: self.check_mx(apex, exp).await,
            dkim: self.check_dkim(apex, exp).await,
            tls_rpt: self.check_tls_rpt(apex, exp).await,
            mta_sts: self.check_mta_sts(apex, exp).await,
            summary: Summary::default(),
        };

        let mut summary = Summary::default();
        for check in report.checks() {
            match check.status {
                CheckStatus::Pass => summary.passed += 1,
                CheckStatus::Fail => summary.failed += 1,
                CheckStatus::Skipped => summary.skipped += 1,
            }
        }
        report.summary = summary;
        debug!(domain = %domain.name, summary = ?report.summary, "verification report");
        report
    }

    async fn txt_records(&self, name: &str) -> Result<Vec<String>, String> {
        match self.lookup.txt(name).await {
            Ok(records) => Ok(records),
            Err(LookupError::NoRecords) => Ok(Vec::new()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn check_verification_txt(&self, exp: &DomainExpectations) -> CheckResult {
        let (Some(name), Some(expected)) = (&exp.txt_name, &exp.txt_value) else {
            return CheckResult::skipped();
        };
        let expected_normal = normalize_txt(expected);

        match self.txt_records(name).await {
            Ok(records) => {
                let found = records
                    .iter()
                    .find(|record| normalize_txt(record) == expected_normal);
                match found {
                    Some(record) => CheckResult::pass(Some(expected.clone()), Some(record.clone())),
                    None => CheckResult::fail(
                        Some(expected.clone()),
                        records.first().cloned(),
                        "verification record not found",
                    ),
                }
            }
            Err(err) => CheckResult::fail(Some(expected.clone()), None, err),
        }
    }

    async fn check_spf(&self, apex: &str, exp: &DomainExpectations) -> CheckResult {
        let Some(expected) = &exp.spf else {
            return CheckResult::skipped();
        };

        match self.txt_records(apex).await {
            Ok(records) => {
                let Some(found) = records.iter().find(|r| r.starts_with("v=spf1")) else {
                    return CheckResult::fail(
                        Some(expected.clone()),
                        None,
                        "no SPF record published",
                    );
                };
                if collapse_ws(found).to_ascii_lowercase()
                    == collapse_ws(expected).to_ascii_lowercase()
                {
                    CheckResult::pass(Some(expected.clone()), Some(found.clone()))
                } else {
                    CheckResult::fail(
                        Some(expected.clone()),
                        Some(found.clone()),
                        "SPF record differs from expectation",
                    )
                }
            }
            Err(err) => CheckResult::fail(Some(expected.clone()), None, err),
        }
    }

    async fn check_dmarc(&self, apex: &str, exp: &DomainExpectations) -> CheckResult {
        let Some(expected) = &exp.dmarc else {
            return CheckResult::skipped();
        };

        match self.txt_records(&format!("_dmarc.{apex}")).await {
            Ok(records) => {
                let found = records.iter().find(|r| r.starts_with("v=DMARC1"));
                match found {
                    Some(record) if strip_ws_lower(record) == strip_ws_lower(expected) => {
                        CheckResult::pass(Some(expected.clone()), Some(record.clone()))
                    }
                    Some(record) => CheckResult::fail(
                        Some(expected.clone()),
                        Some(record.clone()),
                        "DMARC record differs from expectation",
                    ),
                    None => CheckResult::fail(
                        Some(expected.clone()),
                        None,
                        "no DMARC record published",
                    ),
                }
            }
            Err(err) => CheckResult::fail(Some(expected.clone()), None, err),
        }
    }

    async fn check_mx(&self, apex: &str, exp: &DomainExpectations) -> CheckResult {
        if exp.mx.is_empty() {
            return CheckResult::skipped();
        }
        let expected: HashSet<(String, u16)> = exp
            .mx
            .iter()
            .map(|MxRecord { host, priority }| (with_trailing_dot(host), *priority))
            .collect();
        let expected_display = format!("{expected:?}");

        match self.lookup.mx(apex).await {
            Ok(records) => {
                let found: HashSet<(String, u16)> = records
                    .iter()
                    .map(|(host, priority)| (with_trailing_dot(host), *priority))
                    .collect();
                let found_display = format!("{found:?}");
                if found == expected {
                    CheckResult::pass(Some(expected_display), Some(found_display))
                } else {
                    CheckResult::fail(
                        Some(expected_display),
                        Some(found_display),
                        "MX record set differs from expectation",
                    )
                }
            }
            Err(LookupError::NoRecords) => CheckResult::fail(
                Some(expected_display),
                None,
                "no MX records published",
            ),
            Err(err) => CheckResult::fail(Some(expected_display), None, err.to_string()),
        }
    }

    async fn check_dkim(&self, apex: &str, exp: &DomainExpectations) -> CheckResult {
        let (Some(selector), Some(expected_txt)) = (&exp.dkim_selector, &exp.dkim_txt) else {
            return CheckResult::skipped();
        };
        let Some(expected_p) = dkim_p_value(expected_txt) else {
            return CheckResult::fail(
                Some(expected_txt.clone()),
                None,
                "expectation has no p= value",
            );
        };

        match self.txt_records(&format!("{selector}._domainkey.{apex}")).await {
            Ok(records) => {
                let found = records.iter().find(|r| r.contains("v=DKIM1"));
                match found.and_then(|r| dkim_p_value(r)) {
                    Some(found_p) if found_p == expected_p => {
                        CheckResult::pass(Some(expected_txt.clone()), found.cloned())
                    }
                    Some(_) => CheckResult::fail(
                        Some(expected_txt.clone()),
                        found.cloned(),
                        "public key in DNS does not match",
                    ),
                    None => CheckResult::fail(
                        Some(expected_txt.clone()),
                        found.cloned(),
                        "no DKIM record with a p= value",
                    ),
                }
            }
            Err(err) => CheckResult::fail(Some(expected_txt.clone()), None, err),
        }
    }

    async fn check_tls_rpt(&self, apex: &str, exp: &DomainExpectations) -> CheckResult {
        let Some(expected) = &exp.tls_rpt else {
            return CheckResult::skipped();
        };

        match self.txt_records(&format!("_smtp._tls.{apex}")).await {
            Ok(records) => {
                let found = records.iter().find(|r| r.starts_with("v=TLSRPTv1"));
                match found {
                    Some(record)
                        if collapse_ws(record).to_ascii_lowercase()
                            == collapse_ws(expected).to_ascii_lowercase() =>
                    {
                        CheckResult::pass(Some(expected.clone()), Some(record.clone()))
                    }
                    Some(record) => CheckResult::fail(
                        Some(expected.clone()),
                        Some(record.clone()),
                        "TLS-RPT record differs from expectation",
                    ),
                    None => CheckResult::fail(
                        Some(expected.clone()),
                        None,
                        "no TLS-RPT record published",
                    ),
                }
            }
            Err(err) => CheckResult::fail(Some(expected.clone()), None, err),
        }
    }

    /// DNS TXT + CNAME delegation + ACME delegation + the HTTPS policy body.
    async fn check_mta_sts(&self, apex: &str, exp: &DomainExpectations) -> CheckResult {
        let Some(sts) = &exp.mta_sts else {
            return CheckResult::skipped();
        };

        let mut errors = Vec::new();
        let mut found_parts = Vec::new();

        match self.txt_records(&format!("_mta-sts.{apex}")).await {
            Ok(records) => match records.iter().find(|r| STS_TXT.is_match(r)) {
                Some(record) => found_parts.push(format!("txt={record}")),
                None => errors.push("no _mta-sts TXT matching v=STSv1; id=".to_string()),
            },
            Err(err) => errors.push(format!("_mta-sts TXT lookup failed: {err}")),
        }

        if let Some(expected_target) = &sts.cname_target {
            match self.lookup.cname(&format!("mta-sts.{apex}")).await {
                Ok(Some(target)) => {
                    if with_trailing_dot(&target) == with_trailing_dot(expected_target) {
                        found_parts.push(format!("cname={target}"));
                    } else {
                        errors.push(format!(
                            "mta-sts CNAME points at {target}, expected {expected_target}"
                        ));
                    }
                }
                Ok(None) => errors.push("mta-sts CNAME missing".to_string()),
                Err(err) => errors.push(format!("mta-sts CNAME lookup failed: {err}")),
            }
        }

        if let Some(expected_acme) = &sts.acme_cname_target {
            match self
                .lookup
                .cname(&format!("_acme-challenge.mta-sts.{apex}"))
                .await
            {
                Ok(Some(target)) if with_trailing_dot(&target) == with_trailing_dot(expected_acme) => {
                    found_parts.push(format!("acme={target}"));
                }
                Ok(Some(target)) => errors.push(format!(
                    "ACME delegation points at {target}, expected {expected_acme}"
                )),
                Ok(None) => errors.push("ACME delegation CNAME missing".to_string()),
                Err(err) => errors.push(format!("ACME delegation lookup failed: {err}")),
            }
        }

        let policy_url = format!("https://mta-sts.{apex}/.well-known/mta-sts.txt");
        match self.http.get(&policy_url, POLICY_FETCH_TIMEOUT).await {
            Ok(response) if (200..300).contains(&response.status) => {
                match parse_sts_policy(&response.body) {
                    Ok(mode) => {
                        if let Some(expected_mode) = &sts.mode {
                            if &mode != expected_mode {
                                errors.push(format!(
                                    "policy mode is {mode}, expected {expected_mode}"
                                ));
                            }
                        }
                        found_parts.push(format!("policy mode={mode}"));
                    }
                    Err(err) => errors.push(format!("invalid policy body: {err}")),
                }
            }
            Ok(response) => errors.push(format!("policy fetch answered HTTP {}", response.status)),
            Err(err) => errors.push(format!("policy fetch failed: {err}")),
        }

        let found = (!found_parts.is_empty()).then(|| found_parts.join("; "));
        if errors.is_empty() {
            CheckResult {
                status: CheckStatus::Pass,
                expected: sts.txt.clone(),
                found,
                errors,
            }
        } else {
            CheckResult {
                status: CheckStatus::Fail,
                expected: sts.txt.clone(),
                found,
                errors,
            }
        }
    }
}

/// The policy must carry `version: STSv1` plus `mode`, `mx`, and `max_age`;
/// returns the mode.
fn parse_sts_policy(body: &str) -> Result<String, String> {
    let mut version = None;
    let mut mode = None;
    let mut has_mx = false;
    let mut has_max_age = false;

    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "version" => version = Some(value.trim().to_string()),
            "mode" => mode = Some(value.trim().to_string()),
            "mx" => has_mx = true,
            "max_age" => has_max_age = true,
            _ => {}
        }
    }

    match version.as_deref() {
        Some("STSv1") => {}
        Some(other) => return Err(format!("unsupported version {other}")),
        None => return Err("missing version field".to_string()),
    }
    if !has_mx {
        return Err("missing mx field".to_string());
    }
    if !has_max_age {
        return Err("missing max_age field".to_string());
    }
    mode.ok_or_else(|| "missing mode field".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::lookup::{StaticFetch, StaticLookup};
    use crate::models::MtaStsExpectation;
    use crate::store::MemoryStore;

    const DKIM_TXT: &str = "v=DKIM1; k=rsa; p=MIIBIjANBgkq";

    fn expectations() -> DomainExpectations {
        DomainExpectations {
            txt_name: Some("_monkeys.example.com".to_string()),
            txt_value: Some("monkeys-verify=abc123".to_string()),
            spf: Some("v=spf1 include:spf.monkeysmail.com -all".to_string()),
            dmarc: Some("v=DMARC1; p=reject".to_string()),
            mx: vec![
                MxRecord {
                    host: "mx1.monkeysmail.com.".to_string(),
                    priority: 10,
                },
                MxRecord {
                    host: "mx2.monkeysmail.com.".to_string(),
                    priority: 20,
                },
            ],
            dkim_selector: Some("mail".to_string()),
            dkim_txt: Some(DKIM_TXT.to_string()),
            tls_rpt: Some("v=TLSRPTv1; rua=mailto:tls@monkeysmail.com".to_string()),
            mta_sts: Some(MtaStsExpectation {
                txt: Some("v=STSv1; id=20240101".to_string()),
                cname_target: Some("mta-sts.monkeysmail.com".to_string()),
                acme_cname_target: None,
                mode: Some("enforce".to_string()),
            }),
        }
    }

    fn domain(expectations: DomainExpectations) -> Domain {
        Domain {
            id: 1.into(),
            tenant_id: 1.into(),
            name: "example.com".to_string(),
            status: DomainStatus::Pending,
            expectations,
            require_tls: false,
            arc_sign: false,
            bimi_enabled: false,
            last_checked_at: None,
            verified_at: None,
            verification_report: None,
            created_at: Utc::now(),
        }
    }

    fn good_dns() -> StaticLookup {
        StaticLookup::default()
            .with_txt("_monkeys.example.com", &["\"monkeys-verify=abc123\""])
            .with_txt(
                "example.com",
                &["v=spf1   include:spf.monkeysmail.com -all", "other txt"],
            )
            .with_txt("_dmarc.example.com", &["v=DMARC1;p=reject"])
            .with_mx(
                "example.com",
                &[("MX1.monkeysmail.com", 10), ("mx2.monkeysmail.com.", 20)],
            )
            .with_txt("mail._domainkey.example.com", &[DKIM_TXT])
            .with_txt(
                "_smtp._tls.example.com",
                &["v=TLSRPTv1; rua=mailto:tls@monkeysmail.com"],
            )
            .with_txt("_mta-sts.example.com", &["v=STSv1; id=20240101"])
            .with_cname("mta-sts.example.com", "mta-sts.monkeysmail.com.")
    }

    fn good_policy() -> StaticFetch {
        StaticFetch::default().with(
            "https://mta-sts.example.com/.well-known/mta-sts.txt",
            200,
            "version: STSv1\nmode: enforce\nmx: mx1.monkeysmail.com\nmx: mx2.monkeysmail.com\nmax_age: 604800\n",
        )
    }

    fn verifier(dns: StaticLookup, http: StaticFetch, store: Arc<MemoryStore>) -> DomainVerifier {
        DomainVerifier::new(Arc::new(dns), Arc::new(http), store)
    }

    #[tokio::test]
    async fn fully_matching_domain_goes_active() {
        let store = Arc::new(MemoryStore::new());
        store.insert_domain(domain(expectations()));
        let verifier = verifier(good_dns(), good_policy(), store.clone());

        let report = verifier.verify_domain(1.into()).await.unwrap();
        assert!(report.all_passed(), "report: {report:?}");
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.summary.passed, 7);

        let domain = store.domain(1.into()).await.unwrap().unwrap();
        assert_eq!(domain.status, DomainStatus::Active);
        assert!(domain.verified_at.is_some());
        assert!(domain.last_checked_at.is_some());
        assert!(domain.verification_report.is_some());
    }

    #[tokio::test]
    async fn mismatched_dkim_keeps_domain_pending() {
        let store = Arc::new(MemoryStore::new());
        store.insert_domain(domain(expectations()));
        let dns = good_dns().with_txt(
            "mail._domainkey.example.com",
            &["v=DKIM1; k=rsa; p=DIFFERENT"],
        );
        let verifier = verifier(dns, good_policy(), store.clone());

        let report = verifier.verify_domain(1.into()).await.unwrap();
        assert_eq!(report.dkim.status, CheckStatus::Fail);
        assert!(!report.all_passed());

        let domain = store.domain(1.into()).await.unwrap().unwrap();
        assert_eq!(domain.status, DomainStatus::Pending);
        assert!(domain.verified_at.is_none());
    }

    #[tokio::test]
    async fn missing_expectations_are_skipped_not_failed() {
        let store = Arc::new(MemoryStore::new());
        let mut exp = expectations();
        exp.tls_rpt = None;
        exp.mta_sts = None;
        store.insert_domain(domain(exp));
        let verifier = verifier(good_dns(), StaticFetch::default(), store.clone());

        let report = verifier.verify_domain(1.into()).await.unwrap();
        assert_eq!(report.tls_rpt.status, CheckStatus::Skipped);
        assert_eq!(report.mta_sts.status, CheckStatus::Skipped);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn mx_comparison_is_a_set_with_priorities() {
        let store = Arc::new(MemoryStore::new());
        store.insert_domain(domain(expectations()));
        // same hosts, wrong priority on one
        let dns = good_dns().with_mx(
            "example.com",
            &[("mx1.monkeysmail.com", 10), ("mx2.monkeysmail.com", 30)],
        );
        let verifier = verifier(dns, good_policy(), store.clone());

        let report = verifier.verify_domain(1.into()).await.unwrap();
        assert_eq!(report.mx.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn policy_problems_fail_the_sts_check() {
        let store = Arc::new(MemoryStore::new());
        store.insert_domain(domain(expectations()));
        let http = StaticFetch::default().with(
            "https://mta-sts.example.com/.well-known/mta-sts.txt",
            200,
            "version: STSv1\nmode: testing\nmx: mx1.monkeysmail.com\nmax_age: 604800\n",
        );
        let verifier = verifier(good_dns(), http, store.clone());

        let report = verifier.verify_domain(1.into()).await.unwrap();
        assert_eq!(report.mta_sts.status, CheckStatus::Fail);
        assert!(
            report
                .mta_sts
                .errors
                .iter()
                .any(|e| e.contains("policy mode is testing"))
        );
    }

    #[test]
    fn sts_policy_parser_requires_all_fields() {
        assert_eq!(
            parse_sts_policy("version: STSv1\nmode: enforce\nmx: a\nmax_age: 1\n").unwrap(),
            "enforce"
        );
        assert!(parse_sts_policy("mode: enforce\nmx: a\nmax_age: 1\n").is_err());
        assert!(parse_sts_policy("version: STSv1\nmode: enforce\nmax_age: 1\n").is_err());
        assert!(parse_sts_policy("version: STSv1\nmx: a\nmax_age: 1\n").is_err());
    }
}
