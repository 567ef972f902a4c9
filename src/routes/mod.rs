//! Operational HTTP surface.
//!
//! Handlers are annotated with `#[openapi]` so `rocket_okapi` derives the
//! OpenAPI document served next to them.

pub mod health;
pub mod status;
