//! Bounded work queue in front of the mirror.
//!
//! Callers submit a [`MirrorTask`] and get a [`MirrorTicket`] back that
//! resolves once the worker has run the task. A full queue is reported to the
//! caller instead of dropping the task.

use super::{MailMirror, MirrorError, folder_for};
use crate::models::EmailType;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorTask {
    /// Store a newly ingested message in the folder of `category`.
    Append {
        account: String,
        message_id: String,
        category: EmailType,
        raw: Arc<Vec<u8>>,
    },
    Move {
        account: String,
        message_id: String,
        from: EmailType,
        to: EmailType,
    },
    SetSeen {
        account: String,
        message_id: String,
        category: EmailType,
        seen: bool,
    },
}

impl fmt::Display for MirrorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorTask::Append { account, message_id, category, .. } => {
                write!(f, "append {} to {}/{}", message_id, account, category)
            }
            MirrorTask::Move { account, message_id, from, to } => {
                write!(f, "move {} for {} from {} to {}", message_id, account, from, to)
            }
            MirrorTask::SetSeen { account, message_id, seen, .. } => {
                write!(f, "set seen={} on {} for {}", seen, message_id, account)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MirrorStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct MirrorStatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

impl MirrorStats {
    pub fn snapshot(&self) -> MirrorStatsSnapshot {
        MirrorStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Completion handle for a submitted task.
#[derive(Debug)]
pub struct MirrorTicket {
    receiver: oneshot::Receiver<Result<(), MirrorError>>,
}

impl MirrorTicket {
    /// Wait for the worker to finish the task.
    pub async fn wait(self) -> Result<(), MirrorError> {
        self.receiver.await.unwrap_or(Err(MirrorError::WorkerGone))
    }
}

/// Result of handing a mirror task to the queue.
#[derive(Debug)]
pub enum MirrorOutcome {
    /// Mirroring is turned off.
    Disabled,
    Submitted(MirrorTicket),
    Rejected(MirrorError),
}

impl MirrorOutcome {
    pub fn from_submission(queue: Option<&MirrorQueue>, task: MirrorTask) -> Self {
        match queue {
            None => MirrorOutcome::Disabled,
            Some(queue) => match queue.submit(task) {
                Ok(ticket) => MirrorOutcome::Submitted(ticket),
                Err(err) => MirrorOutcome::Rejected(err),
            },
        }
    }

    /// Wait for a submitted task. Disabled counts as success.
    pub async fn wait(self) -> Result<(), MirrorError> {
        match self {
            MirrorOutcome::Disabled => Ok(()),
            MirrorOutcome::Submitted(ticket) => ticket.wait().await,
            MirrorOutcome::Rejected(err) => Err(err),
        }
    }
}

struct Envelope {
    task: MirrorTask,
    reply: oneshot::Sender<Result<(), MirrorError>>,
}

/// Submission side of the mirror queue. Cheap to clone.
#[derive(Clone)]
pub struct MirrorQueue {
    sender: mpsc::Sender<Envelope>,
    stats: Arc<MirrorStats>,
}

impl MirrorQueue {
    /// Create a queue and the worker that drains it. The worker must be run.
    pub fn new(mirror: Arc<dyn MailMirror>, capacity: usize) -> (Self, MirrorWorker) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(MirrorStats::default());
        (
            Self {
                sender,
                stats: stats.clone(),
            },
            MirrorWorker {
                mirror,
                receiver,
                stats,
            },
        )
    }

    pub fn submit(&self, task: MirrorTask) -> Result<MirrorTicket, MirrorError> {
        let (reply, receiver) = oneshot::channel();
        match self.sender.try_send(Envelope { task, reply }) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(MirrorTicket { receiver })
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("mirror queue full, rejected: {}", envelope.task);
                Err(MirrorError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("mirror worker stopped, rejected: {}", envelope.task);
                Err(MirrorError::WorkerGone)
            }
        }
    }

    pub fn stats(&self) -> Arc<MirrorStats> {
        self.stats.clone()
    }
}

/// Single consumer executing mirror tasks in submission order.
pub struct MirrorWorker {
    mirror: Arc<dyn MailMirror>,
    receiver: mpsc::Receiver<Envelope>,
    stats: Arc<MirrorStats>,
}

impl MirrorWorker {
    /// Run until cancelled, then finish the tasks already queued.
    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!("mirror worker started");
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = self.receiver.recv() => envelope,
            };
            match envelope {
                Some(envelope) => self.handle(envelope).await,
                None => break,
            }
        }

        self.receiver.close();
        while let Some(envelope) = self.receiver.recv().await {
            self.handle(envelope).await;
        }
        log::info!("mirror worker stopped");
    }

    async fn handle(&self, envelope: Envelope) {
        let Envelope { task, reply } = envelope;
        let result = execute(self.mirror.as_ref(), &task).await;
        match &result {
            Ok(()) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                log::debug!("mirror: {}", task);
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("mirror: {} failed: {}", task, err);
            }
        }
        // Submitter may have stopped waiting.
        let _ = reply.send(result);
    }
}

async fn resolve_uids(
    mirror: &dyn MailMirror,
    account: &str,
    mailbox: &str,
    message_id: &str,
) -> Result<Vec<u32>, MirrorError> {
    let uids = mirror.find_by_message_id(account, mailbox, message_id).await?;
    if uids.is_empty() {
        return Err(MirrorError::NotFound {
            mailbox: mailbox.to_string(),
            message_id: message_id.to_string(),
        });
    }
    Ok(uids)
}

/// Run one task against the mirror.
pub async fn execute(mirror: &dyn MailMirror, task: &MirrorTask) -> Result<(), MirrorError> {
    match task {
        MirrorTask::Append {
            account,
            message_id,
            category,
            raw,
        } => {
            let appended = mirror
                .append_if_absent(account, folder_for(*category), message_id, raw)
                .await?;
            if !appended {
                log::debug!("mirror already holds {} for {}", message_id, account);
            }
            Ok(())
        }
        MirrorTask::Move {
            account,
            message_id,
            from,
            to,
        } => {
            let source = folder_for(*from);
            let target = folder_for(*to);
            for uid in resolve_uids(mirror, account, source, message_id).await? {
                mirror.move_message(account, source, target, uid).await?;
            }
            Ok(())
        }
        MirrorTask::SetSeen {
            account,
            message_id,
            category,
            seen,
        } => {
            let mailbox = folder_for(*category);
            for uid in resolve_uids(mirror, account, mailbox, message_id).await? {
                mirror.set_seen(account, mailbox, uid, *seen).await?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory::RecordingMirror;

    fn append(id: &str) -> MirrorTask {
        MirrorTask::Append {
            account: "a@x.com".to_string(),
            message_id: id.to_string(),
            category: EmailType::Inbox,
            raw: Arc::new(b"Subject: t\r\n\r\nbody".to_vec()),
        }
    }

    #[tokio::test]
    async fn ticket_resolves_after_worker_runs_task() {
        let mirror = Arc::new(RecordingMirror::default());
        let (queue, worker) = MirrorQueue::new(mirror.clone(), 4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        queue.submit(append("<m1@x>")).unwrap().wait().await.unwrap();
        assert!(mirror.contains("a@x.com", "INBOX", "<m1@x>"));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(queue.stats().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_dropping() {
        let mirror = Arc::new(RecordingMirror::default());
        let (queue, _worker) = MirrorQueue::new(mirror, 1);

        let _first = queue.submit(append("<m1@x>")).unwrap();
        assert!(matches!(queue.submit(append("<m2@x>")), Err(MirrorError::QueueFull)));
        assert_eq!(queue.stats().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn move_of_unknown_message_fails_visibly() {
        let mirror = Arc::new(RecordingMirror::default());
        let (queue, worker) = MirrorQueue::new(mirror, 4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let result = queue
            .submit(MirrorTask::Move {
                account: "a@x.com".to_string(),
                message_id: "<missing@x>".to_string(),
                from: EmailType::Inbox,
                to: EmailType::Deleted,
            })
            .unwrap()
            .wait()
            .await;
        assert!(matches!(result, Err(MirrorError::NotFound { .. })));
        assert_eq!(queue.stats().snapshot().failed, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_worker_drains_queued_tasks() {
        let mirror = Arc::new(RecordingMirror::default());
        let (queue, worker) = MirrorQueue::new(mirror.clone(), 8);
        let first = queue.submit(append("<m1@x>")).unwrap();
        let second = queue.submit(append("<m2@x>")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        worker.run(cancel).await;

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert!(mirror.contains("a@x.com", "INBOX", "<m2@x>"));
    }
}
