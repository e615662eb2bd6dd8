//! Prometheus exposition payload
//!
//! Serves the registry's rendered instruments together with the sink's own
//! dispatch counters. The counters are registered as a collector in the
//! instrument registry, so their names are claimed like any instrument name
//! and can never appear twice in a scrape.

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntCounter, Opts};

use crate::dispatcher::{DispatchSnapshot, OperationDispatcher};
use crate::error::Result;
use crate::registry::{InstrumentRegistry, CONTENT_TYPE};

/// Configuration for the exporter
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Prefix for the sink's own metric names (default: "prometheus_sink")
    pub metric_prefix: String,
    /// Export the dispatch counters with every scrape
    pub include_dispatch_stats: bool,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "prometheus_sink".to_string(),
            include_dispatch_stats: true,
        }
    }
}

/// Names of the dispatch counters for `prefix`
pub fn dispatch_stat_names(prefix: &str) -> [String; 4] {
    ["applied", "unrecognized", "conflicts", "rejected"]
        .map(|stat| format!("{}_operations_{}_total", prefix, stat))
}

/// Mirrors [`DispatchSnapshot`] into counters at collect time
struct DispatchStatsCollector {
    dispatcher: Arc<OperationDispatcher>,
    counters: [IntCounter; 4],
    descs: Vec<Desc>,
    /// Serializes collects; each one rewrites the counters
    collect_lock: Mutex<()>,
}

impl DispatchStatsCollector {
    fn new(prefix: &str, dispatcher: Arc<OperationDispatcher>) -> Result<Self> {
        let [applied, unrecognized, conflicts, rejected] = dispatch_stat_names(prefix);
        let counters = [
            IntCounter::with_opts(Opts::new(applied, "Operations applied to an instrument"))?,
            IntCounter::with_opts(Opts::new(
                unrecognized,
                "Operations dropped for an unknown operation code",
            ))?,
            IntCounter::with_opts(Opts::new(
                conflicts,
                "Operations dropped because the instrument exists with another shape",
            ))?,
            IntCounter::with_opts(Opts::new(
                rejected,
                "Operations dropped for invalid names, labels, values or records",
            ))?,
        ];
        let descs = counters
            .iter()
            .flat_map(|c| c.desc().into_iter().cloned())
            .collect();

        Ok(Self {
            dispatcher,
            counters,
            descs,
            collect_lock: Mutex::new(()),
        })
    }

    fn values(snapshot: &DispatchSnapshot) -> [u64; 4] {
        [
            snapshot.applied,
            snapshot.unrecognized,
            snapshot.conflicts,
            snapshot.rejected,
        ]
    }
}

impl Collector for DispatchStatsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _guard = self.collect_lock.lock();
        let snapshot = self.dispatcher.stats();

        for (counter, value) in self.counters.iter().zip(Self::values(&snapshot)) {
            counter.reset();
            counter.inc_by(value);
        }
        self.counters.iter().flat_map(|c| c.collect()).collect()
    }
}

/// Renders the scrape payload
pub struct PrometheusExporter {
    registry: Arc<InstrumentRegistry>,
}

impl PrometheusExporter {
    /// Create an exporter over the dispatcher's registry.
    ///
    /// Fails when the prefix yields invalid metric names or when an
    /// instrument already uses one of the dispatch counter names.
    pub fn new(config: ExporterConfig, dispatcher: Arc<OperationDispatcher>) -> Result<Self> {
        let registry = Arc::clone(dispatcher.registry());

        if config.include_dispatch_stats {
            let collector = DispatchStatsCollector::new(&config.metric_prefix, dispatcher)?;
            registry.register_collector(Box::new(collector))?;
        }

        Ok(Self { registry })
    }

    /// Export metrics in Prometheus text format.
    ///
    /// Every call renders live state; nothing is cached between scrapes.
    pub fn export(&self) -> Result<String> {
        self.registry.render()
    }

    /// Export metrics as HTTP response body with correct content type
    pub fn export_http(&self) -> Result<(String, &'static str)> {
        Ok((self.export()?, CONTENT_TYPE))
    }
}
