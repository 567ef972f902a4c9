//! Replays state changes made in the mailstore (moves, deletes, read flags)
//! back into the relational store by following the mailstore's operation log,
//! and tracks message file renames in the mailstore's Maildir tree.

pub mod checkpoint;
pub mod grammar;
pub mod maildir;
pub mod reconciler;
pub mod tail;

pub use checkpoint::{CheckpointError, CheckpointFile, ReconcilerCheckpoint};
pub use grammar::{LogEvent, LogRecord, parse_line, parse_log_timestamp};
pub use maildir::{MaildirEntry, MaildirError, MaildirOutcome, MaildirWatcher, parse_maildir_path};
pub use reconciler::{LineOutcome, MirrorReconciler, ReconcileError, SkipReason};
pub use tail::LogTail;
