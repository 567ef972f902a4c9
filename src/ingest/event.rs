//! Inbound notification envelopes.
//!
//! The mail-receiving service publishes one JSON notification per accepted
//! message. Only the fields the pipeline needs are modelled; everything else
//! in the envelope is ignored.

use crate::config::IngestConfig;
use serde::Deserialize;
use thiserror::Error;

pub const RECEIVED_NOTIFICATION: &str = "Received";
pub const OBJECT_STORE_ACTION: &str = "S3";

/// Reasons an event is discarded without processing. All of them are final.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("event body is not a notification: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected notification type `{0}`")]
    NotificationType(String),
    #[error("unsupported receipt action `{0}`")]
    Action(String),
    #[error("object key prefix `{actual}` does not match `{expected}`")]
    KeyPrefix { expected: String, actual: String },
    #[error("bucket `{actual}` is not the inbox bucket `{expected}`")]
    Bucket { expected: String, actual: String },
    #[error("receipt carries no object key")]
    MissingObjectKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub mail: MailSummary,
    #[serde(default)]
    pub receipt: Receipt,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailSummary {
    #[serde(default)]
    pub common_headers: CommonHeaders,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonHeaders {
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Envelope-level recipients the message was accepted for.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub action: ReceiptAction,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptAction {
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub object_key_prefix: String,
    #[serde(default)]
    pub object_key: String,
}

impl InboundEvent {
    pub fn parse(body: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Accept only received-mail notifications stored in the inbox bucket.
    pub fn validate(&self, config: &IngestConfig) -> Result<(), ValidationError> {
        if self.notification_type != RECEIVED_NOTIFICATION {
            return Err(ValidationError::NotificationType(self.notification_type.clone()));
        }

        let action = &self.receipt.action;
        if action.action_type != OBJECT_STORE_ACTION {
            return Err(ValidationError::Action(action.action_type.clone()));
        }
        if action.object_key_prefix != config.object_key_prefix {
            return Err(ValidationError::KeyPrefix {
                expected: config.object_key_prefix.clone(),
                actual: action.object_key_prefix.clone(),
            });
        }
        if action.bucket_name != config.inbox_bucket {
            return Err(ValidationError::Bucket {
                expected: config.inbox_bucket.clone(),
                actual: action.bucket_name.clone(),
            });
        }
        if action.object_key.trim().is_empty() {
            return Err(ValidationError::MissingObjectKey);
        }
        Ok(())
    }

    pub fn object_key(&self) -> &str {
        &self.receipt.action.object_key
    }

    pub fn bucket(&self) -> &str {
        &self.receipt.action.bucket_name
    }

    /// Visible To recipients as a header-style list.
    pub fn to_header(&self) -> String {
        self.mail.common_headers.to.join(", ")
    }

    pub fn cc_header(&self) -> String {
        self.mail.common_headers.cc.join(", ")
    }
}
