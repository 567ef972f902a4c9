//! Inbound ingestion: queue notification to stored, deduplicated,
//! per-recipient mailbox rows.

pub mod attachments;
pub mod dispatcher;
pub mod event;
pub mod hasher;
pub mod mime;
pub mod pipeline;
pub mod recipients;
pub mod shortcode;
pub mod stats;

pub use dispatcher::IngestDispatcher;
pub use event::{InboundEvent, ValidationError};
pub use pipeline::{Delivery, DeliveryReport, Disposition, IngestError, IngestionPipeline, Stage};
pub use recipients::{Recipients, classify};
pub use stats::{IngestStats, IngestStatsSnapshot};
