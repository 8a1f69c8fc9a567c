pub mod lookup;
pub mod verifier;

pub use lookup::{DnsLookup, HickoryLookup, HttpFetch, ReqwestFetch};
pub use verifier::{CheckResult, CheckStatus, DomainVerifier, VerificationReport};
