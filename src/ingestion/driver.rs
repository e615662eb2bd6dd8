//! Ingestion driver

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::source::BlockSource;
use crate::dispatcher::OperationDispatcher;
use crate::error::Result;
use crate::telemetry::ClockTelemetry;
use crate::types::SourceBlock;

/// Totals of one [`IngestionDriver::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionSummary {
    /// Blocks read from the source
    pub blocks: u64,
    /// Operations handed to the dispatcher, applied or not
    pub operations: u64,
    /// Blocks the source could not decode
    pub skipped: u64,
    /// Operations dropped from otherwise decodable blocks
    pub undecodable: u64,
}

/// Feeds source blocks into the dispatcher and the head telemetry
pub struct IngestionDriver {
    dispatcher: Arc<OperationDispatcher>,
    telemetry: Arc<ClockTelemetry>,
}

impl IngestionDriver {
    /// Create a driver
    pub fn new(dispatcher: Arc<OperationDispatcher>, telemetry: Arc<ClockTelemetry>) -> Self {
        Self {
            dispatcher,
            telemetry,
        }
    }

    /// Consume `source` until it ends.
    ///
    /// Operations are dispatched one at a time in arrival order; the block's
    /// clock is applied after its operations. Undecodable blocks are logged
    /// and skipped, while I/O failures end the run with an error.
    pub async fn run(&self, source: &mut dyn BlockSource) -> Result<IngestionSummary> {
        let mut summary = IngestionSummary::default();

        loop {
            let block = match source.next_block().await {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Skipping undecodable block");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            summary.blocks += 1;
            summary.undecodable += block.undecodable;
            summary.operations += self.apply_block(&block);
        }

        info!(
            blocks = summary.blocks,
            operations = summary.operations,
            skipped = summary.skipped,
            undecodable = summary.undecodable,
            "Source exhausted"
        );
        Ok(summary)
    }

    /// Apply one block; returns the number of operations dispatched
    pub fn apply_block(&self, block: &SourceBlock) -> u64 {
        self.dispatcher.record_undecodable(block.undecodable);
        for record in &block.operations {
            self.dispatcher.dispatch(record);
        }

        if let Some(clock) = &block.clock {
            if let Err(e) = self.telemetry.observe(clock) {
                warn!(position = clock.position, error = %e, "Failed to update head telemetry");
            }
        } else {
            debug!(operations = block.operations.len(), "Block without clock");
        }

        block.operations.len() as u64
    }
}
