//! Wire format of per-recipient send jobs. The canonical encoding is one
//! `json` field carrying the job document; workers also accept the legacy
//! flat field layout and a single-field fallback.

use crate::bus::Entry;
use crate::models::{DomainId, MessageId, TenantId};
use crate::smtp::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("entry has no decodable job payload")]
    Unrecognized,
    #[error("malformed job document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("job is missing message_id")]
    MissingMessageId,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SendJob {
    pub message_id: MessageId,
    #[serde(rename = "company_id")]
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<DomainId>,
    pub envelope: Envelope,
    #[serde(default, deserialize_with = "lenient_count")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

/// Retry counters arrive as numbers, numeric strings, or the empty string;
/// everything unparseable reads as 0.
fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

impl SendJob {
    pub fn encode(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        Ok(vec![("json", serde_json::to_string(self)?)])
    }

    pub fn decode(entry: &Entry) -> Result<SendJob, DecodeError> {
        if let Some(json) = entry.field("json") {
            let job: SendJob = serde_json::from_str(json)?;
            return Ok(job);
        }

        // legacy flat encoding with the envelope as a nested JSON string
        if let Some(message_id) = entry.field("message_id") {
            let message_id: MessageId = message_id
                .parse::<i64>()
                .map_err(|_| DecodeError::MissingMessageId)?
                .into();
            let tenant_id: TenantId = entry
                .field("company_id")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
                .into();
            let domain_id: Option<DomainId> = entry
                .field("domain_id")
                .and_then(|v| v.parse::<i64>().ok())
                .map(Into::into);
            let envelope = match entry.field("envelope") {
                Some(raw) => serde_json::from_str(raw)?,
                None => Envelope::default(),
            };
            let retries = entry
                .field("retries")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            return Ok(SendJob {
                message_id,
                tenant_id,
                domain_id,
                envelope,
                retries,
                enqueued_at: None,
            });
        }

        // single-field fallback: any lone field whose value is a job document
        if entry.fields.len() == 1 {
            let (_, value) = &entry.fields[0];
            if let Ok(job) = serde_json::from_str::<SendJob>(value) {
                return Ok(job);
            }
        }

        Err(DecodeError::Unrecognized)
    }
}
