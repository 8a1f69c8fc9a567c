mod audience;
mod domain;
mod message;
mod tenant;
mod usage;
mod webhook;

pub use audience::*;
pub use domain::*;
pub use message::*;
pub use tenant::*;
pub use usage::*;
pub use webhook::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid sender address: {0}")]
    InvalidSender(String),
    #[error("invalid reply-to address: {0}")]
    InvalidReplyTo(String),
    #[error("invalid recipient address: {0}")]
    InvalidRecipients(String),
    #[error("no valid recipients")]
    NoRecipients,
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("every recipient enqueue failed")]
    QueueFailed,
    #[error("entity is owned by a different tenant")]
    CrossTenant,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Database(sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable error kind surfaced to callers, HTTP-analogue mapping included.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidSender(_) => "invalid_sender",
            Error::InvalidReplyTo(_) => "invalid_reply_to",
            Error::InvalidRecipients(_) => "invalid_recipients",
            Error::NoRecipients => "no_recipients",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::QueueFailed => "queue_failed",
            Error::CrossTenant => "cross_tenant",
            Error::NotFound(_) => "not_found",
            Error::Conflict => "conflict",
            Error::BadRequest(_) => "bad_request",
            Error::ForeignKeyViolation
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::Email(_)
            | Error::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("row");
        }
        Error::Database(sql)
    }
}
