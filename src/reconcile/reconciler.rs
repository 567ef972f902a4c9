use super::checkpoint::{CheckpointFile, ReconcilerCheckpoint};
use super::grammar::{LogEvent, parse_line, parse_log_timestamp};
use super::tail::LogTail;
use crate::context::PipelineContext;
use crate::mirror::category_for_folder;
use crate::store::{AccountDirectory, MailboxStore, StoreError};
use chrono::{DateTime, Local, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no local account for {0}")]
    UnknownAccount(String),
    #[error("folder `{0}` has no mailbox category")]
    UnknownFolder(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoTimestamp,
    /// At or before the checkpoint the reconciler started from.
    AlreadyProcessed,
    Unrecognized,
    UnknownAccount,
    UnknownFolder,
    UnknownMessage,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::NoTimestamp => "no timestamp",
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::Unrecognized => "unrecognized",
            SkipReason::UnknownAccount => "unknown account",
            SkipReason::UnknownFolder => "unknown folder",
            SkipReason::UnknownMessage => "unknown message",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Applied,
    Skipped(SkipReason),
    /// The store rejected the update. The line is not retried.
    Failed,
}

/// Replays mailstore log records into the relational store.
///
/// Moves and flag changes are applied unconditionally by Message-ID; the log
/// is the record of what the user did in their mail client. A checkpoint is
/// written after every handled line.
pub struct MirrorReconciler {
    accounts: Arc<dyn AccountDirectory>,
    mailboxes: Arc<dyn MailboxStore>,
    checkpoint: CheckpointFile,
    resume_after: DateTime<Utc>,
    last_processed: DateTime<Utc>,
    /// Last stamp known to be on disk.
    saved: DateTime<Utc>,
    progress: watch::Sender<ReconcilerCheckpoint>,
}

impl MirrorReconciler {
    /// Start from the saved checkpoint, or from now if there is none.
    pub async fn load(ctx: &PipelineContext, checkpoint: CheckpointFile) -> Self {
        let resume = checkpoint.load_or_now().await;
        Self::new(ctx, checkpoint, resume)
    }

    pub fn new(ctx: &PipelineContext, checkpoint: CheckpointFile, resume: ReconcilerCheckpoint) -> Self {
        let (progress, _) = watch::channel(resume);
        Self {
            accounts: ctx.accounts.clone(),
            mailboxes: ctx.mailboxes.clone(),
            checkpoint,
            resume_after: resume.last_processed_time,
            last_processed: resume.last_processed_time,
            saved: resume.last_processed_time,
            progress,
        }
    }

    /// Latest checkpoint, updated as lines are handled.
    pub fn progress(&self) -> watch::Receiver<ReconcilerCheckpoint> {
        self.progress.subscribe()
    }

    pub fn last_processed(&self) -> DateTime<Utc> {
        self.last_processed
    }

    /// Consume the tail until cancelled. The line in hand is finished first.
    pub async fn run(mut self, mut tail: LogTail, cancel: CancellationToken) {
        log::info!(
            "reconciler started after {}",
            self.resume_after.to_rfc3339()
        );
        while let Some(line) = tail.next_line(&cancel).await {
            self.process_line(&line, Local::now()).await;
        }
        log::info!(
            "reconciler stopped at {}",
            self.last_processed.to_rfc3339()
        );
    }

    /// Handle one log line. `now` completes the year of the line's timestamp.
    pub async fn process_line(&mut self, line: &str, now: DateTime<Local>) -> LineOutcome {
        let Some(stamp) = parse_log_timestamp(line, now) else {
            return LineOutcome::Skipped(SkipReason::NoTimestamp);
        };
        if stamp <= self.resume_after {
            return LineOutcome::Skipped(SkipReason::AlreadyProcessed);
        }

        let outcome = match parse_line(line) {
            LogEvent::Unrecognized => return LineOutcome::Skipped(SkipReason::Unrecognized),
            event => match self.apply(&event).await {
                Ok(()) => LineOutcome::Applied,
                Err(ReconcileError::UnknownAccount(account)) => {
                    log::warn!("reconciler {}: no local account {}, skipping", stamp, account);
                    LineOutcome::Skipped(SkipReason::UnknownAccount)
                }
                Err(ReconcileError::UnknownFolder(folder)) => {
                    log::warn!("reconciler {}: unmapped folder `{}`, skipping", stamp, folder);
                    LineOutcome::Skipped(SkipReason::UnknownFolder)
                }
                Err(ReconcileError::Store(e)) if e.is_not_found() => {
                    log::info!("reconciler {}: {}, skipping", stamp, e);
                    LineOutcome::Skipped(SkipReason::UnknownMessage)
                }
                Err(e) => {
                    log::error!("reconciler {}: {}", stamp, e);
                    LineOutcome::Failed
                }
            },
        };

        if outcome != LineOutcome::Failed {
            self.advance(stamp).await;
        }
        outcome
    }

    async fn apply(&self, event: &LogEvent) -> Result<(), ReconcileError> {
        let record = match event {
            LogEvent::Move { record, .. } | LogEvent::Delete(record) | LogEvent::FlagChange(record) => record,
            LogEvent::Unrecognized => return Ok(()),
        };
        let account = self
            .accounts
            .find_by_address(&record.account)
            .await?
            .ok_or_else(|| ReconcileError::UnknownAccount(record.account.clone()))?;

        match event {
            LogEvent::Move { from, record } => {
                let to = category_for_folder(&record.mailbox)
                    .ok_or_else(|| ReconcileError::UnknownFolder(record.mailbox.clone()))?;
                self.mailboxes
                    .move_by_message_id(account.id, &record.message_id, to)
                    .await?;
                log::debug!("reconciler: {} moved {} -> {}", record.message_id, from, to);
            }
            LogEvent::Delete(record) => {
                self.mailboxes
                    .delete_by_message_id(account.id, &record.message_id)
                    .await?;
                log::debug!("reconciler: {} deleted", record.message_id);
            }
            LogEvent::FlagChange(record) => {
                let read = record.has_flag("Seen");
                self.mailboxes
                    .set_read_by_message_id(account.id, &record.message_id, read)
                    .await?;
                log::debug!("reconciler: {} read={}", record.message_id, read);
            }
            LogEvent::Unrecognized => {}
        }
        Ok(())
    }

    /// Move the checkpoint forward to `stamp`. A failed save is retried with
    /// the next handled line, even one from the same second.
    async fn advance(&mut self, stamp: DateTime<Utc>) {
        if stamp > self.last_processed {
            self.last_processed = stamp;
            self.progress.send_replace(ReconcilerCheckpoint {
                last_processed_time: stamp,
            });
        }
        if self.saved >= self.last_processed {
            return;
        }

        let checkpoint = ReconcilerCheckpoint {
            last_processed_time: self.last_processed,
        };
        match self.checkpoint.save(&checkpoint).await {
            Ok(()) => self.saved = checkpoint.last_processed_time,
            Err(e) => log::warn!("reconciler: saving checkpoint failed: {}", e),
        }
    }
}
