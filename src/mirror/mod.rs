//! IMAP mirror of mailbox state.
//!
//! The relational store is the source of truth; the mirror receives appended
//! messages and user-driven moves and flag changes. Every mirror operation is
//! idempotent so retries and replays are safe. Operations are submitted
//! through [`tasks::MirrorQueue`], never issued fire-and-forget.

pub mod folders;
pub mod imap;
pub mod tasks;

pub use folders::{category_for_folder, folder_for};
pub use imap::ImapMirror;
pub use tasks::{MirrorOutcome, MirrorQueue, MirrorStats, MirrorStatsSnapshot, MirrorTask, MirrorTicket, MirrorWorker};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("mirror TLS failed: {0}")]
    Tls(#[from] tokio_native_tls::native_tls::Error),
    #[error("mirror login failed for {account}: {source}")]
    Login {
        account: String,
        source: async_imap::error::Error,
    },
    #[error("mirror command failed: {0}")]
    Imap(#[from] async_imap::error::Error),
    #[error("message {message_id} not found in {mailbox}")]
    NotFound { mailbox: String, message_id: String },
    #[error("mirror queue is full")]
    QueueFull,
    #[error("mirror worker has stopped")]
    WorkerGone,
}

/// Mailbox operations against an IMAP-style backend, acting on behalf of `account`.
#[async_trait]
pub trait MailMirror: Send + Sync {
    /// Append `raw` unless a message with `message_id` is already in `mailbox`.
    /// Returns whether an append happened.
    async fn append_if_absent(
        &self,
        account: &str,
        mailbox: &str,
        message_id: &str,
        raw: &[u8],
    ) -> Result<bool, MirrorError>;

    async fn move_message(&self, account: &str, source: &str, target: &str, uid: u32) -> Result<(), MirrorError>;

    async fn set_seen(&self, account: &str, mailbox: &str, uid: u32, seen: bool) -> Result<(), MirrorError>;

    async fn find_by_message_id(
        &self,
        account: &str,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Vec<u32>, MirrorError>;
}
