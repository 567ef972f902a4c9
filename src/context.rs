//! Explicit handles shared by the pipeline, the reconciler and the mailbox
//! service. Components receive this instead of reaching for process globals,
//! which is also how tests swap in in-memory collaborators.

use crate::ingest::stats::IngestStats;
use crate::mirror::MirrorQueue;
use crate::storage::ObjectStore;
use crate::store::{AccountDirectory, AttachmentStore, MailboxStore, PgMailStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct PipelineContext {
    pub accounts: Arc<dyn AccountDirectory>,
    pub mailboxes: Arc<dyn MailboxStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub objects: Arc<dyn ObjectStore>,
    /// `None` when mirroring is disabled.
    pub mirror: Option<MirrorQueue>,
    pub stats: Arc<IngestStats>,
}

impl PipelineContext {
    /// Context where every relational concern is served by one Postgres store.
    pub fn with_postgres(
        store: PgMailStore,
        objects: Arc<dyn ObjectStore>,
        mirror: Option<MirrorQueue>,
        stats: Arc<IngestStats>,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            accounts: store.clone(),
            mailboxes: store.clone(),
            attachments: store,
            objects,
            mirror,
            stats,
        }
    }
}
