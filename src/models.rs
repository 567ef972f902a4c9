use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_db_pools::sqlx::types::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ===== Accounts =====

/// Sharding key for per-account mailbox tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct AccountId(pub i32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub domain_id: i32,
    pub domain_name: String,
    pub address: String,
}

#[derive(Debug, FromRow)]
pub(crate) struct AccountRow {
    pub id: i32,
    pub domain_id: i32,
    pub domain_name: String,
    pub email_address: String,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: AccountId(row.id),
            domain_id: row.domain_id,
            domain_name: row.domain_name,
            address: row.email_address,
        }
    }
}

// ===== Mailbox categories =====

/// Mailbox category a message lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EmailType {
    Inbox,
    Sent,
    Trash,
    Draft,
    Deleted,
}

impl EmailType {
    pub const ALL: [EmailType; 5] = [
        EmailType::Inbox,
        EmailType::Sent,
        EmailType::Trash,
        EmailType::Draft,
        EmailType::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::Inbox => "inbox",
            EmailType::Sent => "sent",
            EmailType::Trash => "trash",
            EmailType::Draft => "draft",
            EmailType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EmailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown email type `{0}`")]
pub struct UnknownEmailType(pub String);

impl FromStr for EmailType {
    type Err = UnknownEmailType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(EmailType::Inbox),
            "sent" => Ok(EmailType::Sent),
            "trash" => Ok(EmailType::Trash),
            "draft" => Ok(EmailType::Draft),
            "deleted" => Ok(EmailType::Deleted),
            other => Err(UnknownEmailType(other.to_string())),
        }
    }
}

// ===== Attachments =====

/// Content-addressed attachment metadata. `file_hash` is unique across the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct Attachment {
    pub file_hash: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub source_key: String,
    pub short_code: String,
    pub download_url: String,
    pub storage_path: String,
    pub expire_time: DateTime<Utc>,
}

// ===== Messages =====

/// A message ready to be written into one recipient's mailbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub message_id: String,
    pub email_hash: String,
    pub recipient_email: String,
    pub s3_key: String,
    pub sender_name: String,
    pub sender_email: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub is_read: bool,
    pub email_type: EmailType,
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
}

/// One stored row of an account's mailbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MailboxMessage {
    pub id: i32,
    pub message_id: String,
    pub file_name: Option<String>,
    pub domain_id: i32,
    pub domain_name: String,
    pub email_hash: String,
    pub email_account_id: AccountId,
    pub email_address: String,
    pub recipient_email: String,
    pub s3_key: String,
    pub sender_name: String,
    pub sender_email: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub is_read: bool,
    pub email_type: EmailType,
    pub attachment_info: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl MailboxMessage {
    /// Materialize a stored row from a freshly inserted message.
    pub fn from_new(id: i32, account: &Account, message: &NewMessage, now: DateTime<Utc>) -> Self {
        MailboxMessage {
            id,
            message_id: message.message_id.clone(),
            file_name: None,
            domain_id: account.domain_id,
            domain_name: account.domain_name.clone(),
            email_hash: message.email_hash.clone(),
            email_account_id: account.id,
            email_address: account.address.clone(),
            recipient_email: message.recipient_email.clone(),
            s3_key: message.s3_key.clone(),
            sender_name: message.sender_name.clone(),
            sender_email: message.sender_email.clone(),
            cc: message.cc.clone(),
            bcc: message.bcc.clone(),
            subject: message.subject.clone(),
            body_text: message.body_text.clone(),
            body_html: message.body_html.clone(),
            is_read: message.is_read,
            email_type: message.email_type,
            attachment_info: message.attachments.clone(),
            received_at: message.received_at,
            created_at: now,
            last_update_at: now,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MailboxMessageRow {
    pub id: i32,
    pub email_message_id: String,
    pub file_name: Option<String>,
    pub domain_id: i32,
    pub domain_name: String,
    pub email_hash: String,
    pub email_account_id: i32,
    pub email_address: String,
    pub recipient_email: String,
    pub s3_key: String,
    pub sender_name: String,
    pub sender_email: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub is_read: bool,
    pub email_type: String,
    pub attachment_info: Json<Vec<Attachment>>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl TryFrom<MailboxMessageRow> for MailboxMessage {
    type Error = UnknownEmailType;

    fn try_from(row: MailboxMessageRow) -> Result<Self, Self::Error> {
        Ok(MailboxMessage {
            id: row.id,
            message_id: row.email_message_id,
            file_name: row.file_name,
            domain_id: row.domain_id,
            domain_name: row.domain_name,
            email_hash: row.email_hash,
            email_account_id: AccountId(row.email_account_id),
            email_address: row.email_address,
            recipient_email: row.recipient_email,
            s3_key: row.s3_key,
            sender_name: row.sender_name,
            sender_email: row.sender_email,
            cc: row.cc,
            bcc: row.bcc,
            subject: row.subject,
            body_text: row.body_text,
            body_html: row.body_html,
            is_read: row.is_read,
            email_type: row.email_type.parse()?,
            attachment_info: row.attachment_info.0,
            received_at: row.received_at,
            created_at: row.created_at,
            last_update_at: row.last_update_at,
        })
    }
}

/// One page of a mailbox listing along with the total row count for the category.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessagePage {
    pub messages: Vec<MailboxMessage>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

// ===== API envelopes =====

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_type_round_trips_through_text() {
        for kind in EmailType::ALL {
            assert_eq!(kind.as_str().parse::<EmailType>().unwrap(), kind);
        }
        assert_eq!(" INBOX ".parse::<EmailType>().unwrap(), EmailType::Inbox);
        assert!("spam".parse::<EmailType>().is_err());
    }

    #[test]
    fn email_type_serializes_lowercase() {
        let json = serde_json::to_string(&EmailType::Deleted).unwrap();
        assert_eq!(json, "\"deleted\"");
    }
}
