use super::event::InboundEvent;
use super::pipeline::{Disposition, IngestionPipeline};
use super::stats::IngestStats;
use crate::queue::{EventSource, QueuedEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECEIVE_BACKOFF: Duration = Duration::from_secs(10);

/// Long-polls the event source and feeds each event through the pipeline,
/// acknowledging according to how processing ended.
pub struct IngestDispatcher {
    source: Arc<dyn EventSource>,
    pipeline: Arc<IngestionPipeline>,
    stats: Arc<IngestStats>,
}

impl IngestDispatcher {
    pub fn new(source: Arc<dyn EventSource>, pipeline: Arc<IngestionPipeline>) -> Self {
        let stats = pipeline.stats().clone();
        Self {
            source,
            pipeline,
            stats,
        }
    }

    /// Poll until cancelled. An in-flight batch is finished before returning.
    pub async fn run(self, cancel: CancellationToken) {
        let batch_size = self.pipeline.config().poll_batch_size;
        let wait = self.pipeline.config().poll_wait;
        log::info!("ingest dispatcher started (batch {}, wait {:?})", batch_size, wait);

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.source.receive(batch_size, wait) => received,
            };

            let events = match received {
                Ok(events) => events,
                Err(e) => {
                    log::error!("ingest dispatcher: receive failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                    }
                }
            };

            for event in &events {
                self.handle(event).await;
            }
        }

        log::info!("ingest dispatcher stopped");
    }

    /// Process one delivery and settle it with the source.
    pub async fn handle(&self, event: &QueuedEvent) -> Disposition {
        IngestStats::incr(&self.stats.events_received);

        let disposition = match InboundEvent::parse(&event.body) {
            Err(e) => {
                IngestStats::incr(&self.stats.events_rejected);
                log::warn!("ingest: discarding unparseable event: {}", e);
                Disposition::Ack
            }
            Ok(inbound) => match self.pipeline.process(&inbound).await {
                Ok(_) => Disposition::Ack,
                Err(e) => {
                    let config = self.pipeline.config();
                    let disposition = e.disposition(event.receive_count, config.decode_retry_limit);
                    match disposition {
                        Disposition::Ack => {
                            IngestStats::incr(&self.stats.events_rejected);
                            log::warn!("ingest: {}", e);
                        }
                        Disposition::Retry => {
                            log::warn!("ingest: {} (attempt {}, will retry)", e, event.receive_count);
                        }
                        Disposition::DeadLetter => {
                            log::error!(
                                "ingest: giving up after {} attempts: {}",
                                event.receive_count,
                                e
                            );
                        }
                    }
                    disposition
                }
            },
        };

        match disposition {
            Disposition::Retry => IngestStats::incr(&self.stats.events_retried),
            Disposition::Ack | Disposition::DeadLetter => {
                if disposition == Disposition::DeadLetter {
                    IngestStats::incr(&self.stats.events_dead_lettered);
                }
                match self.source.acknowledge(event).await {
                    Ok(()) => IngestStats::incr(&self.stats.events_acked),
                    Err(e) => log::error!("ingest: acknowledge failed: {}", e),
                }
            }
        }
        disposition
    }
}
