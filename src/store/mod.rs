//! Relational persistence for accounts, per-account mailbox tables and
//! content-addressed attachments.
//!
//! The pipeline and reconciler talk to storage only through the traits in this
//! module. Every mailbox operation takes the owning [`AccountId`] as an explicit
//! sharding key; the physical table it resolves to is decided in
//! [`partition`] and nowhere else.
//!
//! - [`AccountDirectory`] resolves recipient addresses to accounts
//! - [`MailboxStore`] reads and mutates one account's messages
//! - [`AttachmentStore`] deduplicates attachment metadata by content hash
//!
//! [`PgMailStore`] implements all three over a Postgres pool.

pub mod migration;
pub mod partition;
pub mod postgres;

pub use migration::run_migrations;
pub use postgres::PgMailStore;

use crate::models::{Account, AccountId, Attachment, EmailType, MailboxMessage, MessagePage, NewMessage, UnknownEmailType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("message {id} is `{actual}`, expected `{expected}`")]
    PreconditionFailed {
        id: i32,
        expected: EmailType,
        actual: EmailType,
    },
    #[error("message {message_id} already exists")]
    DuplicateMessage { message_id: String },
    #[error("page {page} is out of range ({total} messages)")]
    PageOutOfRange { page: u32, total: i64 },
    #[error("failed to encode attachment metadata: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(#[from] UnknownEmailType),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::Database(sqlx::Error::RowNotFound)
        )
    }
}

/// Address to account resolution.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Look up an account by address, case-insensitively.
    async fn find_by_address(&self, address: &str) -> Result<Option<Account>, StoreError>;
}

/// Operations on one account's mailbox table.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Whether a message with this content fingerprint is already stored for the account.
    async fn exists(&self, account: AccountId, email_hash: &str) -> Result<bool, StoreError>;

    /// Write one message row, returning its generated id. A Message-ID already
    /// present in the table yields [`StoreError::DuplicateMessage`].
    async fn insert(&self, account: &Account, message: &NewMessage) -> Result<i32, StoreError>;

    /// One page (1-based) of a category, newest `received_at` first.
    async fn list(
        &self,
        account: AccountId,
        email_type: EmailType,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, StoreError>;

    /// Messages of a category with an id greater than `after_id`, oldest first.
    async fn list_since(
        &self,
        account: AccountId,
        email_type: EmailType,
        after_id: i32,
        limit: u32,
    ) -> Result<Vec<MailboxMessage>, StoreError>;

    async fn get(&self, account: AccountId, id: i32) -> Result<MailboxMessage, StoreError>;

    /// Change a message's category only if it currently is `from`.
    async fn move_type(
        &self,
        account: AccountId,
        id: i32,
        from: EmailType,
        to: EmailType,
    ) -> Result<(), StoreError>;

    async fn set_read(&self, account: AccountId, id: i32, read: bool) -> Result<(), StoreError>;

    async fn update_file_name(
        &self,
        account: AccountId,
        message_id: &str,
        file_name: &str,
    ) -> Result<(), StoreError>;

    /// Delete-if-exists. Deleting an absent message is not an error.
    async fn delete_by_message_id(&self, account: AccountId, message_id: &str) -> Result<(), StoreError>;

    /// Unconditional category change keyed by Message-ID.
    async fn move_by_message_id(
        &self,
        account: AccountId,
        message_id: &str,
        to: EmailType,
    ) -> Result<(), StoreError>;

    async fn set_read_by_message_id(
        &self,
        account: AccountId,
        message_id: &str,
        read: bool,
    ) -> Result<(), StoreError>;
}

/// Content-addressed attachment metadata.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Attachment>, StoreError>;

    async fn find_by_short_code(&self, short_code: &str) -> Result<Option<Attachment>, StoreError>;

    /// Batched insert that skips rows whose hash already exists. Returns rows written.
    async fn insert_batch(&self, attachments: &[Attachment]) -> Result<u64, StoreError>;

    /// Replace the download link of the row for `file_hash`.
    async fn renew_url(
        &self,
        file_hash: &str,
        download_url: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Number of pages needed to show `total` rows.
pub fn page_count(total: i64, page_size: u32) -> i64 {
    if total <= 0 {
        0
    } else {
        (total + page_size as i64 - 1) / page_size as i64
    }
}

/// Validate a 1-based page against the row count. Page 1 of an empty category is valid.
pub fn check_page(page: u32, page_size: u32, total: i64) -> Result<(), StoreError> {
    if page == 0 || (page > 1 && page as i64 > page_count(total, page_size)) {
        return Err(StoreError::PageOutOfRange { page, total });
    }
    Ok(())
}
