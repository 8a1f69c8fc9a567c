//! DKIM key material and milter table management. Signing itself happens in
//! the external milter; this module owns key generation, the key/signing/
//! trusted-hosts tables, and the reload signal.

mod keys;
mod registrar;
mod service;

pub use keys::{DkimKeyMaterial, KeyService, dkim_txt_name, dkim_txt_value};
pub use registrar::{Registrar, SigningEntry, SyncReport, TableSync};
pub use service::DkimRegistrar;

use std::sync::LazyLock;

/// opendkim selector syntax; also the upper bound for a DNS label.
pub(crate) static SELECTOR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9-]{1,63}$").expect("valid selector pattern"));
