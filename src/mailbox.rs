//! User-driven mailbox changes.
//!
//! The relational update happens first and decides success. The matching
//! mirror task is then submitted and handed back to the caller as a
//! [`MirrorOutcome`], so callers choose whether to wait for the mirror.

use crate::context::PipelineContext;
use crate::mirror::{MirrorOutcome, MirrorQueue, MirrorTask};
use crate::models::{Account, EmailType, MailboxMessage, MessagePage};
use crate::store::{MailboxStore, StoreError};
use std::sync::Arc;

#[derive(Clone)]
pub struct MailboxService {
    mailboxes: Arc<dyn MailboxStore>,
    mirror: Option<MirrorQueue>,
    page_size: u32,
}

impl MailboxService {
    pub fn new(ctx: &PipelineContext, page_size: u32) -> Self {
        Self {
            mailboxes: ctx.mailboxes.clone(),
            mirror: ctx.mirror.clone(),
            page_size: page_size.max(1),
        }
    }

    /// Move message `id` from `from` to `to`. Fails with
    /// [`StoreError::PreconditionFailed`] if it is no longer in `from`.
    pub async fn move_message(
        &self,
        account: &Account,
        id: i32,
        from: EmailType,
        to: EmailType,
    ) -> Result<MirrorOutcome, StoreError> {
        self.mailboxes.move_type(account.id, id, from, to).await?;
        let message = self.mailboxes.get(account.id, id).await?;
        log::info!("account {}: moved {} from {} to {}", account.id, message.message_id, from, to);

        Ok(self.submit(MirrorTask::Move {
            account: account.address.clone(),
            message_id: message.message_id,
            from,
            to,
        }))
    }

    pub async fn set_read(&self, account: &Account, id: i32, read: bool) -> Result<MirrorOutcome, StoreError> {
        self.mailboxes.set_read(account.id, id, read).await?;
        let message = self.mailboxes.get(account.id, id).await?;

        Ok(self.submit(MirrorTask::SetSeen {
            account: account.address.clone(),
            message_id: message.message_id,
            category: message.email_type,
            seen: read,
        }))
    }

    /// Fetch a message, marking it read if it was not.
    pub async fn open_message(
        &self,
        account: &Account,
        id: i32,
    ) -> Result<(MailboxMessage, MirrorOutcome), StoreError> {
        let mut message = self.mailboxes.get(account.id, id).await?;
        if message.is_read {
            return Ok((message, MirrorOutcome::Disabled));
        }

        self.mailboxes.set_read(account.id, id, true).await?;
        message.is_read = true;
        let outcome = self.submit(MirrorTask::SetSeen {
            account: account.address.clone(),
            message_id: message.message_id.clone(),
            category: message.email_type,
            seen: true,
        });
        Ok((message, outcome))
    }

    pub async fn list(&self, account: &Account, email_type: EmailType, page: u32) -> Result<MessagePage, StoreError> {
        self.mailboxes
            .list(account.id, email_type, page, self.page_size)
            .await
    }

    /// Messages newer than `after_id`, at most one page.
    pub async fn list_since(
        &self,
        account: &Account,
        email_type: EmailType,
        after_id: i32,
    ) -> Result<Vec<MailboxMessage>, StoreError> {
        self.mailboxes
            .list_since(account.id, email_type, after_id, self.page_size)
            .await
    }

    fn submit(&self, task: MirrorTask) -> MirrorOutcome {
        MirrorOutcome::from_submission(self.mirror.as_ref(), task)
    }
}
