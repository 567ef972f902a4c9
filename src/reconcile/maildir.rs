//! Keeps the stored Maildir file name of each message current.
//!
//! The mailstore renames a message file whenever its flags change or it moves
//! between folders. Each new name under a `cur/` directory is read for its
//! Message-ID and recorded against the owning account, which is taken from the
//! `{domain}/{user}/Maildir` part of the path.

use crate::context::PipelineContext;
use crate::ingest::mime::normalize_message_id;
use crate::models::EmailType;
use crate::store::{AccountDirectory, MailboxStore};
use mailparse::MailHeaderMap;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Index and uid-list files the mailstore keeps next to messages.
const IGNORED_FILES: [&str; 6] = [
    "dovecot-uidlist",
    "dovecot-uidlist.lock",
    "dovecot-uidlist.tmp",
    "dovecot.index.log",
    "dovecot.index.cache",
    "dovecot.list.index.log",
];

static FILE_NAME: OnceLock<Regex> = OnceLock::new();

/// `{seconds}.{unique}.{host}` prefix of a Maildir message file.
fn file_name_regex() -> &'static Regex {
    FILE_NAME.get_or_init(|| Regex::new(r"\d+\.\w+\.\w+").expect("Invalid maildir file name regex"))
}

#[derive(Debug, Error)]
pub enum MaildirError {
    #[error("maildir watch on {path}: {source}")]
    Watch { path: PathBuf, source: notify::Error },
}

/// A message file under some account's `Maildir/.../cur/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaildirEntry {
    /// `user@domain`.
    pub account: String,
    /// Folder directory, `""` for the inbox.
    pub folder: String,
    pub category: Option<EmailType>,
    pub file_name: String,
    /// Flagged trashed inside the trash or junk folder.
    pub deleted: bool,
}

/// Category of a Maildir++ folder directory.
pub fn category_for_maildir_folder(folder: &str) -> Option<EmailType> {
    match folder {
        "" | ".Inbox" => Some(EmailType::Inbox),
        ".Junk" => Some(EmailType::Trash),
        ".Trash" => Some(EmailType::Deleted),
        ".Sent" => Some(EmailType::Sent),
        ".Drafts" => Some(EmailType::Draft),
        _ => None,
    }
}

/// Recognize a message file path. Anything else (index files, `tmp/` and
/// `new/` deliveries, paths outside an account's Maildir) yields `None`.
pub fn parse_maildir_path(path: &Path) -> Option<MaildirEntry> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    let (file_name, dirs) = parts.split_last()?;
    if IGNORED_FILES.contains(file_name) || !file_name_regex().is_match(file_name) {
        return None;
    }
    let (leaf, dirs) = dirs.split_last()?;
    if *leaf != "cur" {
        return None;
    }

    let maildir = dirs.iter().rposition(|part| *part == "Maildir")?;
    if maildir < 2 {
        return None;
    }
    let domain = dirs[maildir - 2];
    let user = dirs[maildir - 1];
    let folder = dirs[maildir + 1..].join("/");
    if folder.split('/').any(|part| part == "tmp" || part == "new") {
        return None;
    }

    let deleted = matches!(folder.as_str(), ".Trash" | ".Junk")
        && (file_name.ends_with(":2,T") || file_name.ends_with(":2,ST"));

    Some(MaildirEntry {
        account: format!("{}@{}", user, domain),
        category: category_for_maildir_folder(&folder),
        folder,
        file_name: file_name.to_string(),
        deleted,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaildirOutcome {
    Updated,
    /// Not a message file, or a file already gone again.
    Ignored,
    /// Flagged for deletion; the log reconciler removes the row.
    Deleted,
    NoMessageId,
    UnknownAccount,
    UnknownMessage,
    Failed,
}

/// Watches a Maildir root and records message file renames.
pub struct MaildirWatcher {
    root: PathBuf,
    accounts: Arc<dyn AccountDirectory>,
    mailboxes: Arc<dyn MailboxStore>,
}

impl MaildirWatcher {
    pub fn new(ctx: &PipelineContext, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            accounts: ctx.accounts.clone(),
            mailboxes: ctx.mailboxes.clone(),
        }
    }

    /// Watch until cancelled. Fails only if the root cannot be watched.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), MaildirError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch_err = |source| MaildirError::Watch {
            path: self.root.clone(),
            source,
        };

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })
        .map_err(watch_err)?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(watch_err)?;
        log::info!("watching maildir {}", self.root.display());

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Ok(event) if is_new_name(&event.kind) => {
                    for path in &event.paths {
                        self.handle_path(path).await;
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("maildir watch error: {}", e),
            }
        }

        log::info!("maildir watcher stopped");
        Ok(())
    }

    /// Record the file at `path` as the current file of its message.
    pub async fn handle_path(&self, path: &Path) -> MaildirOutcome {
        let Some(entry) = parse_maildir_path(path) else {
            return MaildirOutcome::Ignored;
        };
        if entry.deleted {
            log::info!("maildir: {} deleted from {} by {}", entry.file_name, entry.folder, entry.account);
            return MaildirOutcome::Deleted;
        }

        let message_id = match read_message_id(path).await {
            Ok(Some(message_id)) => message_id,
            Ok(None) => {
                log::warn!("maildir: {} has no Message-ID", path.display());
                return MaildirOutcome::NoMessageId;
            }
            Err(e) => {
                log::debug!("maildir: {} unreadable: {}", path.display(), e);
                return MaildirOutcome::Ignored;
            }
        };

        let account = match self.accounts.find_by_address(&entry.account).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                log::warn!("maildir: no local account {}, skipping", entry.account);
                return MaildirOutcome::UnknownAccount;
            }
            Err(e) => {
                log::error!("maildir: account lookup for {} failed: {}", entry.account, e);
                return MaildirOutcome::Failed;
            }
        };

        match self
            .mailboxes
            .update_file_name(account.id, &message_id, &entry.file_name)
            .await
        {
            Ok(()) => {
                log::debug!(
                    "maildir: {} is now {} in {:?}",
                    message_id,
                    entry.file_name,
                    entry.category
                );
                MaildirOutcome::Updated
            }
            Err(e) if e.is_not_found() => {
                log::info!("maildir: {} not stored for {}, skipping", message_id, entry.account);
                MaildirOutcome::UnknownMessage
            }
            Err(e) => {
                log::error!("maildir: updating {} failed: {}", message_id, e);
                MaildirOutcome::Failed
            }
        }
    }
}

/// Creations and the destination side of renames.
fn is_new_name(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)))
}

async fn read_message_id(path: &Path) -> std::io::Result<Option<String>> {
    let bytes = tokio::fs::read(path).await?;
    let Ok((headers, _)) = mailparse::parse_headers(&bytes) else {
        return Ok(None);
    };
    Ok(headers
        .get_first_value("Message-ID")
        .filter(|value| !value.trim().is_empty())
        .map(|value| normalize_message_id(&value)))
}
