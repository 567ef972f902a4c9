//! Process wiring: builds the production collaborators from the environment
//! and owns the long-lived background tasks.
//!
//! Shutdown is two-phase. Producers (the ingest dispatcher and the reconcilers)
//! are cancelled and awaited first, so every mirror task they submitted is
//! already queued; then the mirror worker is cancelled and drains its queue.

use crate::config::{IngestConfig, MirrorConfig, ReconcileConfig};
use crate::context::PipelineContext;
use crate::ingest::{IngestDispatcher, IngestStats, IngestionPipeline};
use crate::mailbox::MailboxService;
use crate::mirror::{ImapMirror, MirrorQueue, MirrorWorker};
use crate::queue::SqsEventSource;
use crate::reconcile::{CheckpointFile, LogTail, MaildirWatcher, MirrorReconciler};
use crate::routes::status::PipelineMonitor;
use crate::storage::S3ObjectStore;
use crate::store::PgMailStore;
use parking_lot::Mutex;
use rocket_db_pools::sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything Rocket manages for the pipeline.
pub struct Assembly {
    pub monitor: PipelineMonitor,
    pub mailbox: MailboxService,
    pub workers: Workers,
}

/// Build the pipeline over `pool` with the cloud and IMAP adapters.
pub async fn assemble(pool: PgPool) -> Assembly {
    let ingest = IngestConfig::from_env();
    let mirror = MirrorConfig::from_env();
    let reconcile = ReconcileConfig::from_env();
    let stats = Arc::new(IngestStats::default());

    let sdk = load_aws_config(&ingest).await;

    let (mirror_queue, mirror_worker) = if mirror.enabled {
        log::info!("imap mirror enabled for {}:{}", mirror.host, mirror.port);
        let capacity = mirror.queue_capacity;
        let (queue, worker) = MirrorQueue::new(Arc::new(ImapMirror::new(mirror)), capacity);
        (Some(queue), Some(worker))
    } else {
        log::info!("imap mirror disabled");
        (None, None)
    };

    let ctx = PipelineContext::with_postgres(
        PgMailStore::new(pool),
        Arc::new(S3ObjectStore::new(&sdk)),
        mirror_queue.clone(),
        stats.clone(),
    );

    let dispatcher = if ingest.enabled && !ingest.queue_url.is_empty() {
        let source = Arc::new(SqsEventSource::new(&sdk, ingest.queue_url.clone()));
        let pipeline = Arc::new(IngestionPipeline::new(ctx.clone(), ingest.clone()));
        Some(IngestDispatcher::new(source, pipeline))
    } else {
        log::info!("ingestion disabled (set MAIL_INGEST_ENABLED and MAIL_QUEUE_URL)");
        None
    };

    let reconciler = if reconcile.enabled {
        let reconciler = MirrorReconciler::load(&ctx, CheckpointFile::new(&reconcile.checkpoint_path)).await;
        let tail = LogTail::new(&reconcile.log_path, reconcile.poll_interval);
        Some((reconciler, tail))
    } else {
        log::info!("mirror reconciler disabled");
        None
    };

    let maildir = match (&reconcile.maildir_root, reconcile.enabled) {
        (Some(root), true) => Some(MaildirWatcher::new(&ctx, root)),
        _ => None,
    };

    let monitor = PipelineMonitor {
        ingest: stats,
        mirror: mirror_queue.as_ref().map(MirrorQueue::stats),
        reconciler: reconciler.as_ref().map(|(reconciler, _)| reconciler.progress()),
    };

    Assembly {
        monitor,
        mailbox: MailboxService::new(&ctx, ingest.page_size),
        workers: Workers::new(Pending {
            dispatcher,
            mirror: mirror_worker,
            reconciler,
            maildir,
        }),
    }
}

async fn load_aws_config(config: &IngestConfig) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(profile) = &config.profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

/// Tasks built at ignite and not yet spawned.
pub struct Pending {
    pub dispatcher: Option<IngestDispatcher>,
    pub mirror: Option<MirrorWorker>,
    pub reconciler: Option<(MirrorReconciler, LogTail)>,
    pub maildir: Option<MaildirWatcher>,
}

pub struct Workers {
    producers: CancellationToken,
    mirror: CancellationToken,
    pending: Mutex<Option<Pending>>,
    producer_handles: Mutex<Vec<JoinHandle<()>>>,
    mirror_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Workers {
    pub fn new(pending: Pending) -> Self {
        Self {
            producers: CancellationToken::new(),
            mirror: CancellationToken::new(),
            pending: Mutex::new(Some(pending)),
            producer_handles: Mutex::new(Vec::new()),
            mirror_handle: Mutex::new(None),
        }
    }

    /// Spawn the pending tasks. Later calls do nothing.
    pub fn start(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };

        if let Some(worker) = pending.mirror {
            let cancel = self.mirror.clone();
            *self.mirror_handle.lock() = Some(tokio::spawn(worker.run(cancel)));
        }

        let mut handles = self.producer_handles.lock();
        if let Some(dispatcher) = pending.dispatcher {
            handles.push(tokio::spawn(dispatcher.run(self.producers.clone())));
        }
        if let Some((reconciler, tail)) = pending.reconciler {
            handles.push(tokio::spawn(reconciler.run(tail, self.producers.clone())));
        }
        if let Some(watcher) = pending.maildir {
            let cancel = self.producers.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = watcher.run(cancel).await {
                    log::error!("{}", e);
                }
            }));
        }
        log::info!("started {} pipeline task(s)", handles.len());
    }

    /// Stop pulling new work, let in-flight work finish, then drain the mirror.
    pub async fn shutdown(&self) {
        self.producers.cancel();
        let producers = std::mem::take(&mut *self.producer_handles.lock());
        for handle in producers {
            if let Err(e) = handle.await {
                log::error!("pipeline task ended abnormally: {}", e);
            }
        }

        self.mirror.cancel();
        let mirror = self.mirror_handle.lock().take();
        if let Some(handle) = mirror {
            if let Err(e) = handle.await {
                log::error!("mirror worker ended abnormally: {}", e);
            }
        }
        log::info!("pipeline tasks drained");
    }
}
