use crate::ingest::{IngestStats, IngestStatsSnapshot};
use crate::mirror::{MirrorStats, MirrorStatsSnapshot};
use crate::models::ApiResponse;
use crate::reconcile::ReconcilerCheckpoint;
use chrono::{DateTime, Utc};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Read-only handles on the background workers, managed as Rocket state.
#[derive(Clone)]
pub struct PipelineMonitor {
    pub ingest: Arc<IngestStats>,
    /// Absent when mirroring is disabled.
    pub mirror: Option<Arc<MirrorStats>>,
    /// Absent when the reconciler is disabled.
    pub reconciler: Option<watch::Receiver<ReconcilerCheckpoint>>,
}

impl PipelineMonitor {
    pub fn snapshot(&self) -> PipelineStatus {
        PipelineStatus {
            ingest: self.ingest.snapshot(),
            mirror: self.mirror.as_ref().map(|stats| stats.snapshot()),
            checkpoint: self
                .reconciler
                .as_ref()
                .map(|progress| progress.borrow().last_processed_time),
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct PipelineStatus {
    pub ingest: IngestStatsSnapshot,
    pub mirror: Option<MirrorStatsSnapshot>,
    /// Timestamp of the last operation-log line the reconciler handled.
    pub checkpoint: Option<DateTime<Utc>>,
}

#[openapi(tag = "Pipeline")]
#[get("/pipeline/status")]
pub fn pipeline_status(monitor: &State<PipelineMonitor>) -> Json<ApiResponse<PipelineStatus>> {
    Json(ApiResponse::new(monitor.snapshot()))
}
