use mail_ingest::ingest::IngestStats;
use mail_ingest::reconcile::ReconcilerCheckpoint;
use mail_ingest::routes::status::{PipelineMonitor, pipeline_status};
use mail_ingest::test_support::TestRocketBuilder;
use chrono::{TimeZone, Utc};
use rocket::http::Status;
use rocket::routes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

#[test]
fn status_reports_counters_and_checkpoint() {
    let stats = Arc::new(IngestStats::default());
    IngestStats::incr(&stats.events_received);
    IngestStats::incr(&stats.events_received);
    IngestStats::incr(&stats.messages_stored);

    let checkpoint = ReconcilerCheckpoint {
        last_processed_time: Utc.with_ymd_and_hms(2025, 3, 4, 10, 15, 2).unwrap(),
    };
    let (_progress, receiver) = watch::channel(checkpoint);

    let monitor = PipelineMonitor {
        ingest: stats,
        mirror: None,
        reconciler: Some(receiver),
    };
    let client = TestRocketBuilder::new()
        .manage(monitor)
        .mount_api_routes(routes![pipeline_status])
        .blocking_client();

    let response = client.get("/api/v1/pipeline/status").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: Value = response.into_json().expect("valid JSON payload");
    let data = &payload["data"];
    assert_eq!(data["ingest"]["events_received"], 2);
    assert_eq!(data["ingest"]["messages_stored"], 1);
    assert!(data["mirror"].is_null());
    assert_eq!(data["checkpoint"], "2025-03-04T10:15:02Z");
}
