//! Liveness and readiness checks.

use crate::models::ApiResponse;
use rocket::State;
use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// `ok`, or `unavailable` when a dependency failed its check.
    pub status: String,
}

impl HealthResponse {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// The process is up and serving requests.
#[openapi(tag = "Health")]
#[get("/health/live")]
pub fn live_health() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::new(HealthResponse::ok()))
}

/// The database answers queries.
#[openapi(tag = "Health")]
#[get("/health/ready")]
pub async fn ready_health(pool: &State<PgPool>) -> status::Custom<Json<ApiResponse<HealthResponse>>> {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool.inner()).await {
        Ok(_) => status::Custom(Status::Ok, Json(ApiResponse::new(HealthResponse::ok()))),
        Err(e) => {
            log::warn!("readiness check failed: {}", e);
            status::Custom(
                Status::ServiceUnavailable,
                Json(ApiResponse::new(HealthResponse {
                    status: "unavailable".to_string(),
                })),
            )
        }
    }
}
