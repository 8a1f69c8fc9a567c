//! Outbound SMTP port. The production sender speaks to the configured relay
//! with `mail-send`; the recording sender backs the test suite.

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use mail_send::SmtpClientBuilder;
use mail_send::mail_builder::MessageBuilder;
use mail_send::mail_builder::headers::raw::Raw;
use mail_send::smtp::message::Message as SmtpMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// SMTP envelope for one delivery. Jobs carry exactly one address in the
/// bucket it was submitted under.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Envelope {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }
}

/// Body and attachments, assembled by the worker after tracking injection.
#[derive(Debug, Clone, Default)]
pub struct MailContent {
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default = "default_content_type", rename = "contentType")]
    pub content_type: String,
    pub content: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub ok: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn success(message_id: Option<String>) -> Self {
        Self {
            ok: true,
            message_id,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, content: &MailContent, envelope: &Envelope) -> SendOutcome;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub helo_host: String,
    pub implicit_tls: bool,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn new_from_env() -> Self {
        Self {
            host: std::env::var("SMTP_RELAY_HOST").expect("Missing SMTP_RELAY_HOST env var"),
            port: std::env::var("SMTP_RELAY_PORT")
                .unwrap_or_else(|_| "587".into())
                .parse()
                .expect("SMTP_RELAY_PORT must be a u16"),
            helo_host: std::env::var("SMTP_EHLO_DOMAIN")
                .expect("Missing SMTP_EHLO_DOMAIN env var"),
            implicit_tls: false,
            timeout: Duration::from_secs(15),
        }
    }
}

pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_body(content: &MailContent, envelope: &Envelope) -> Result<Vec<u8>, String> {
        let mut builder = MessageBuilder::new().subject(content.subject.as_str());

        builder = match &envelope.from_name {
            Some(name) => builder.from((name.as_str(), envelope.from.as_str())),
            None => builder.from(envelope.from.as_str()),
        };
        if let Some(reply_to) = &envelope.reply_to {
            builder = builder.reply_to(reply_to.as_str());
        }
        if !envelope.to.is_empty() {
            builder = builder.to(envelope.to.iter().map(String::as_str).collect::<Vec<_>>());
        }
        if !envelope.cc.is_empty() {
            builder = builder.cc(envelope.cc.iter().map(String::as_str).collect::<Vec<_>>());
        }
        if !envelope.bcc.is_empty() {
            builder = builder.bcc(envelope.bcc.iter().map(String::as_str).collect::<Vec<_>>());
        }
        for (name, value) in &envelope.headers {
            builder = builder.header(name.clone(), Raw::new(value.clone()));
        }
        if let Some(html) = &content.html {
            builder = builder.html_body(html.as_str());
        }
        if let Some(text) = &content.text {
            builder = builder.text_body(text.as_str());
        }
        for attachment in &content.attachments {
            let bytes = Base64::decode_vec(attachment.content.trim())
                .map_err(|e| format!("invalid base64 attachment {}: {e}", attachment.filename))?;
            builder = builder.attachment(
                attachment.content_type.clone(),
                attachment.filename.clone(),
                bytes,
            );
        }

        builder
            .write_to_vec()
            .map_err(|e| format!("could not serialize message: {e}"))
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send(&self, content: &MailContent, envelope: &Envelope) -> SendOutcome {
        let body = match Self::build_body(content, envelope) {
            Ok(body) => body,
            Err(error) => return SendOutcome::failure(error),
        };

        let message = SmtpMessage {
            mail_from: envelope.from.as_str().into(),
            rcpt_to: envelope.recipients().map(Into::into).collect(),
            body: body.into(),
        };

        let builder = SmtpClientBuilder::new(self.config.host.clone(), self.config.port)
            .implicit_tls(self.config.implicit_tls)
            .helo_host(self.config.helo_host.clone())
            .timeout(self.config.timeout);

        let result = match builder.connect().await {
            Ok(mut client) => {
                let sent = client.send(message).await;
                client
                    .quit()
                    .await
                    .inspect_err(|err| debug!("failed to close SMTP connection: {err}"))
                    .ok();
                sent
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => SendOutcome::success(None),
            Err(err) => SendOutcome::failure(format!("{} failure: {err}", classify(&err))),
        }
    }
}

/// SMTP 4xx replies and transport hiccups are worth retrying; everything
/// else is a permanent rejection.
fn classify(err: &mail_send::Error) -> &'static str {
    match err {
        mail_send::Error::UnexpectedReply(reply)
        | mail_send::Error::AuthenticationFailed(reply) => {
            if reply.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                "temporary"
            } else {
                "permanent"
            }
        }
        mail_send::Error::Io(_)
        | mail_send::Error::Tls(_)
        | mail_send::Error::Timeout
        | mail_send::Error::UnparseableReply => "temporary",
        _ => "permanent",
    }
}

/// Records every send and replays scripted outcomes; successful by default.
#[derive(Default)]
pub struct RecordingSender {
    outcomes: Mutex<Vec<SendOutcome>>,
    sent: Mutex<Vec<(MailContent, Envelope)>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next send; drained front to back.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }

    pub fn sent(&self) -> Vec<(MailContent, Envelope)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSender for RecordingSender {
    async fn send(&self, content: &MailContent, envelope: &Envelope) -> SendOutcome {
        self.sent
            .lock()
            .unwrap()
            .push((content.clone(), envelope.clone()));
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            SendOutcome::success(Some(format!("mock-{}", self.sent.lock().unwrap().len())))
        } else {
            outcomes.remove(0)
        }
    }
}
