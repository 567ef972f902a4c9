use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the dispatcher and the pipeline.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub events_received: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_acked: AtomicU64,
    pub events_retried: AtomicU64,
    pub events_dead_lettered: AtomicU64,
    pub messages_stored: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub unknown_recipients: AtomicU64,
    pub recipient_failures: AtomicU64,
    pub mirror_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct IngestStatsSnapshot {
    pub events_received: u64,
    pub events_rejected: u64,
    pub events_acked: u64,
    pub events_retried: u64,
    pub events_dead_lettered: u64,
    pub messages_stored: u64,
    pub duplicates_skipped: u64,
    pub unknown_recipients: u64,
    pub recipient_failures: u64,
    pub mirror_failures: u64,
}

impl IngestStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        IngestStatsSnapshot {
            events_received: load(&self.events_received),
            events_rejected: load(&self.events_rejected),
            events_acked: load(&self.events_acked),
            events_retried: load(&self.events_retried),
            events_dead_lettered: load(&self.events_dead_lettered),
            messages_stored: load(&self.messages_stored),
            duplicates_skipped: load(&self.duplicates_skipped),
            unknown_recipients: load(&self.unknown_recipients),
            recipient_failures: load(&self.recipient_failures),
            mirror_failures: load(&self.mirror_failures),
        }
    }
}
