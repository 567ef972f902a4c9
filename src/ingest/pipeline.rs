//! The inbound write path for one notification.
//!
//! ```text
//! Received -> Validated -> Fetched -> Decoded -> Dispatched -> Persisted -> Mirrored -> Acked
//!    |            |           |          |
//!    |         Rejected    Retryable  Retryable (capped)
//! ```
//!
//! Dispatch is per recipient: each address is resolved to an account and
//! checked for the message fingerprint on its own, so a message already held by
//! one mailbox is still delivered to the others. Recipient failures are logged
//! and counted but never fail the event. Acking is the dispatcher's job; this
//! module only reports how the event ended.

use super::attachments::{AttachmentError, AttachmentProcessor};
use super::event::{InboundEvent, ValidationError};
use super::hasher::message_fingerprint;
use super::mime::{DecodeError, DecodedMessage, decode};
use super::recipients::{Recipients, classify};
use super::stats::IngestStats;
use crate::config::IngestConfig;
use crate::context::PipelineContext;
use crate::mirror::{MirrorOutcome, MirrorTask};
use crate::models::{Account, AccountId, Attachment, EmailType, NewMessage};
use crate::storage::ObjectStoreError;
use crate::store::StoreError;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Fetched,
    Decoded,
    Dispatched,
    Persisted,
    Mirrored,
    Acked,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Fetched => "fetched",
            Stage::Decoded => "decoded",
            Stage::Dispatched => "dispatched",
            Stage::Persisted => "persisted",
            Stage::Mirrored => "mirrored",
            Stage::Acked => "acked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("event rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("source object {key} no longer exists")]
    ObjectMissing { key: String },
    #[error("fetching {key} failed: {source}")]
    Fetch {
        key: String,
        source: ObjectStoreError,
    },
    #[error("decoding {key} failed: {source}")]
    Decode { key: String, source: DecodeError },
    #[error("storing attachments of {key} failed: {source}")]
    Attachments {
        key: String,
        source: AttachmentError,
    },
}

/// What the dispatcher should do with the source event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave the event for redelivery.
    Retry,
    /// Give up on an event that keeps failing; it is acked and logged.
    DeadLetter,
}

impl IngestError {
    pub fn disposition(&self, receive_count: u32, decode_retry_limit: u32) -> Disposition {
        match self {
            IngestError::Rejected(_) | IngestError::ObjectMissing { .. } => Disposition::Ack,
            IngestError::Fetch { .. } => Disposition::Retry,
            IngestError::Decode { .. } if receive_count >= decode_retry_limit => Disposition::DeadLetter,
            IngestError::Decode { .. } => Disposition::Retry,
            IngestError::Attachments { .. } => Disposition::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub address: String,
    pub account: AccountId,
    pub id: i32,
}

/// Per-recipient results for one processed event.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub message_id: String,
    pub recipients: Recipients,
    pub delivered: Vec<Delivery>,
    pub duplicates: Vec<String>,
    pub unknown: Vec<String>,
    pub failed: Vec<String>,
    pub attachments: usize,
}

enum Screened {
    Pending(String, Account),
    Duplicate(String),
    Unknown(String),
    Failed(String),
}

enum Written {
    Delivered(Delivery),
    Duplicate(String),
    Failed(String),
}

pub struct IngestionPipeline {
    ctx: PipelineContext,
    config: IngestConfig,
    attachments: AttachmentProcessor,
}

impl IngestionPipeline {
    pub fn new(ctx: PipelineContext, config: IngestConfig) -> Self {
        let attachments = AttachmentProcessor::new(ctx.objects.clone(), ctx.attachments.clone(), &config);
        Self {
            ctx,
            config,
            attachments,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.ctx.stats
    }

    /// Run one event through the write path.
    pub async fn process(&self, event: &InboundEvent) -> Result<DeliveryReport, IngestError> {
        let key = event.object_key().to_string();
        log::debug!("event {}: {}", key, Stage::Received);

        event.validate(&self.config)?;
        log::debug!("event {}: {}", key, Stage::Validated);

        let raw = self
            .ctx
            .objects
            .get(event.bucket(), &key)
            .await
            .map_err(|source| match source {
                ObjectStoreError::NotFound { .. } => IngestError::ObjectMissing { key: key.clone() },
                source => IngestError::Fetch {
                    key: key.clone(),
                    source,
                },
            })?;
        log::debug!("event {}: {} ({} bytes)", key, Stage::Fetched, raw.len());

        let decoded = decode(&raw, &self.config.mail_domain).map_err(|source| IngestError::Decode {
            key: key.clone(),
            source,
        })?;
        log::debug!("event {}: {} as {}", key, Stage::Decoded, decoded.message_id);

        let fingerprint = message_fingerprint(&decoded);
        let recipients = self.classify(event, &decoded);

        let mut report = DeliveryReport {
            message_id: decoded.message_id.clone(),
            recipients: recipients.clone(),
            ..DeliveryReport::default()
        };

        let concurrency = self.config.recipient_concurrency;
        let screened: Vec<Screened> = stream::iter(recipients.all.iter().cloned())
            .map(|address| self.screen(address, &fingerprint))
            .buffered(concurrency)
            .collect()
            .await;

        let mut pending = Vec::new();
        for outcome in screened {
            match outcome {
                Screened::Pending(address, account) => pending.push((address, account)),
                Screened::Duplicate(address) => report.duplicates.push(address),
                Screened::Unknown(address) => report.unknown.push(address),
                Screened::Failed(address) => report.failed.push(address),
            }
        }
        log::debug!(
            "event {}: {} to {} of {} recipients",
            key,
            Stage::Dispatched,
            pending.len(),
            recipients.all.len()
        );

        if pending.is_empty() {
            log::info!("event {}: nothing to deliver for {}", key, decoded.message_id);
            return Ok(report);
        }

        let attachments = self
            .attachments
            .process(&key, &decoded.parts)
            .await
            .map_err(|source| IngestError::Attachments {
                key: key.clone(),
                source,
            })?;
        report.attachments = attachments.len();

        let message = self.build_message(&key, &fingerprint, &decoded, &recipients, attachments);
        let raw = Arc::new(decoded.raw);

        let written: Vec<Written> = stream::iter(pending)
            .map(|(address, account)| self.deliver(address, account, &message, raw.clone()))
            .buffered(concurrency)
            .collect()
            .await;

        for outcome in written {
            match outcome {
                Written::Delivered(delivery) => report.delivered.push(delivery),
                Written::Duplicate(address) => report.duplicates.push(address),
                Written::Failed(address) => report.failed.push(address),
            }
        }

        log::info!(
            "event {}: {} delivered to {}, {} duplicate, {} unknown, {} failed",
            key,
            report.message_id,
            report.delivered.len(),
            report.duplicates.len(),
            report.unknown.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Visible recipients come from the notification, falling back to the
    /// message headers when the notification carries none.
    fn classify(&self, event: &InboundEvent, decoded: &DecodedMessage) -> Recipients {
        let headers = &event.mail.common_headers;
        let (to, cc) = if headers.to.is_empty() && headers.cc.is_empty() {
            (decoded.to_header.clone(), decoded.cc_header.clone())
        } else {
            (event.to_header(), event.cc_header())
        };
        classify(&event.receipt.recipients, &to, &cc)
    }

    async fn screen(&self, address: String, fingerprint: &str) -> Screened {
        let stats = &self.ctx.stats;
        let account = match self.ctx.accounts.find_by_address(&address).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                IngestStats::incr(&stats.unknown_recipients);
                log::warn!("recipient {} has no local account, dropping", address);
                return Screened::Unknown(address);
            }
            Err(err) => {
                IngestStats::incr(&stats.recipient_failures);
                log::error!("recipient {}: account lookup failed: {}", address, err);
                return Screened::Failed(address);
            }
        };

        match self.ctx.mailboxes.exists(account.id, fingerprint).await {
            Ok(true) => {
                IngestStats::incr(&stats.duplicates_skipped);
                log::info!("recipient {} already has this message, skipping", address);
                Screened::Duplicate(address)
            }
            Ok(false) => Screened::Pending(address, account),
            Err(err) => {
                IngestStats::incr(&stats.recipient_failures);
                log::error!("recipient {}: dedup check failed: {}", address, err);
                Screened::Failed(address)
            }
        }
    }

    fn build_message(
        &self,
        key: &str,
        fingerprint: &str,
        decoded: &DecodedMessage,
        recipients: &Recipients,
        attachments: Vec<Attachment>,
    ) -> NewMessage {
        let received_at = decoded.date.unwrap_or_else(|| {
            log::warn!(
                "event {}: unusable Date `{}`, using ingestion time",
                key,
                decoded.date_header
            );
            Utc::now()
        });

        NewMessage {
            message_id: decoded.message_id.clone(),
            email_hash: fingerprint.to_string(),
            recipient_email: recipients.to.join(","),
            s3_key: key.to_string(),
            sender_name: decoded.sender_name.clone(),
            sender_email: decoded.sender_email.clone(),
            cc: recipients.cc.join(","),
            // Blind recipients are never revealed to other mailboxes.
            bcc: String::new(),
            subject: decoded.subject.clone(),
            body_text: decoded.text_body.clone(),
            body_html: decoded.html_body.clone(),
            is_read: false,
            email_type: EmailType::Inbox,
            attachments,
            received_at,
        }
    }

    async fn deliver(&self, address: String, account: Account, message: &NewMessage, raw: Arc<Vec<u8>>) -> Written {
        let stats = &self.ctx.stats;
        let id = match self.ctx.mailboxes.insert(&account, message).await {
            Ok(id) => id,
            Err(StoreError::DuplicateMessage { message_id }) => {
                IngestStats::incr(&stats.duplicates_skipped);
                log::info!("recipient {} already holds {}, skipping", address, message_id);
                return Written::Duplicate(address);
            }
            Err(err) => {
                IngestStats::incr(&stats.recipient_failures);
                log::error!("recipient {}: storing {} failed: {}", address, message.message_id, err);
                return Written::Failed(address);
            }
        };
        IngestStats::incr(&stats.messages_stored);
        log::debug!("recipient {}: {} as #{}", address, Stage::Persisted, id);

        let outcome = MirrorOutcome::from_submission(
            self.ctx.mirror.as_ref(),
            MirrorTask::Append {
                account: account.address.clone(),
                message_id: message.message_id.clone(),
                category: message.email_type,
                raw,
            },
        );
        match outcome {
            MirrorOutcome::Disabled => {}
            outcome => match outcome.wait().await {
                Ok(()) => log::debug!("recipient {}: {}", address, Stage::Mirrored),
                Err(err) => {
                    IngestStats::incr(&stats.mirror_failures);
                    log::warn!("recipient {}: mirror append of {} failed: {}", address, message.message_id, err);
                }
            },
        }

        Written::Delivered(Delivery {
            address,
            account: account.id,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_follow_error_taxonomy() {
        let rejected = IngestError::Rejected(ValidationError::MissingObjectKey);
        assert_eq!(rejected.disposition(1, 5), Disposition::Ack);

        let missing = IngestError::ObjectMissing { key: "email/a".into() };
        assert_eq!(missing.disposition(1, 5), Disposition::Ack);

        let fetch = IngestError::Fetch {
            key: "email/a".into(),
            source: ObjectStoreError::Request("timeout".into()),
        };
        assert_eq!(fetch.disposition(99, 5), Disposition::Retry);

        let decode = || IngestError::Decode {
            key: "email/a".into(),
            source: DecodeError::Malformed("no header block".into()),
        };
        assert_eq!(decode().disposition(4, 5), Disposition::Retry);
        assert_eq!(decode().disposition(5, 5), Disposition::DeadLetter);

        let attachments = IngestError::Attachments {
            key: "email/a".into(),
            source: AttachmentError::Store(StoreError::not_found("attachment", "h")),
        };
        assert_eq!(attachments.disposition(1, 5), Disposition::Retry);
    }
}
