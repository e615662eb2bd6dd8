//! Ingestion pipeline
//!
//! A [`BlockSource`] yields [`SourceBlock`](crate::types::SourceBlock)s; the
//! [`IngestionDriver`] applies each block's operations through the dispatcher
//! and then reports the block's clock to the head telemetry.

mod driver;
mod source;

pub use driver::{IngestionDriver, IngestionSummary};
pub use source::{open_source, BlockSource, ChannelSource, JsonLinesSource};
