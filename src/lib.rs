//! Prometheus sink
//!
//! Applies a stream of metric operation records to an in-memory Prometheus
//! registry and serves it for scraping.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  OperationRecord  ┌─────────────────────┐   ┌────────────────────┐
//! │ BlockSource  │──────────────────▶│ OperationDispatcher │──▶│ InstrumentRegistry │
//! │ (JSON lines, │                   └─────────────────────┘   │                    │
//! │  channel)    │  PositionClock    ┌─────────────────────┐   │                    │
//! │              │──────────────────▶│ ClockTelemetry      │──▶│                    │
//! └──────────────┘                   └─────────────────────┘   └─────────┬──────────┘
//!                                                                        │ render()
//!                                    ┌─────────────────────┐   ┌─────────▼──────────┐
//!                      scraper ◀─────│ MetricsServer       │◀──│ PrometheusExporter │
//!                                    └─────────────────────┘   └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_sink::{
//!     registry::InstrumentRegistry, dispatcher::OperationDispatcher,
//!     types::{op_code, MetricKind, OperationRecord},
//! };
//!
//! let registry = Arc::new(InstrumentRegistry::default());
//! let dispatcher = OperationDispatcher::new(Arc::clone(&registry));
//!
//! dispatcher.dispatch(
//!     &OperationRecord::new("requests_total", MetricKind::Counter, op_code::ADD, 3.0)
//!         .with_label("route", "/a"),
//! );
//! println!("{}", registry.render()?);
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exporter;
pub mod ingestion;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod types;

pub use config::{load_config, SinkConfig};
pub use dispatcher::{DispatchOutcome, OperationDispatcher};
pub use error::{Error, Result};
pub use exporter::{ExporterConfig, PrometheusExporter};
pub use ingestion::{BlockSource, IngestionDriver};
pub use registry::{InstrumentOptions, InstrumentRegistry};
pub use server::MetricsServer;
pub use telemetry::ClockTelemetry;
pub use types::{MetricKind, OperationRecord, PositionClockSignal, SourceBlock};
