//! Instrument registry
//!
//! Owns every named instrument and renders them in the Prometheus text
//! exposition format.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   InstrumentRegistry                      │
//! │  ┌────────────────────────┐   ┌────────────────────────┐ │
//! │  │ name -> Instrument      │   │ prometheus::Registry   │ │
//! │  │ (shape: kind + labels)  │──▶│ counters, gauges,      │ │
//! │  │                         │   │ histograms, process    │ │
//! │  └────────────────────────┘   └────────────────────────┘ │
//! │              │                                            │
//! │              ▼                                            │
//! │       SummaryVec (rendered next to the encoder output)    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Instruments are created on first reference and keep their shape for the
//! lifetime of the process. A reference with a different kind or label-name
//! set is reported as [`Error::ShapeConflict`] and leaves the instrument
//! untouched.

mod options;
mod summary;

pub use options::{
    InstrumentOptions, SummaryOpts, DEFAULT_HELP, DEFAULT_SUMMARY_MAX_AGE,
    DEFAULT_SUMMARY_MAX_SAMPLES, DEFAULT_SUMMARY_QUANTILES,
};
pub use summary::SummaryVec;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::MetricKind;

/// Content type of the rendered payload
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Fixed shape of an instrument: its kind and sorted label names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Instrument kind
    pub kind: MetricKind,
    /// Label names, sorted and deduplicated
    pub label_names: Vec<String>,
}

impl Shape {
    /// Create a shape; label names are normalized
    pub fn new<I, S>(kind: MetricKind, label_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut label_names: Vec<String> = label_names.into_iter().map(Into::into).collect();
        label_names.sort();
        label_names.dedup();
        Self { kind, label_names }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.label_names.join(","))
    }
}

/// Typed handle to the underlying instrument
#[derive(Debug, Clone)]
pub enum InstrumentHandle {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
    Summary(Arc<SummaryVec>),
}

/// A registered instrument
#[derive(Debug)]
pub struct Instrument {
    name: String,
    shape: Shape,
    handle: InstrumentHandle,
}

impl Instrument {
    /// Instrument name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind and label names fixed at creation
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Instrument kind
    pub fn kind(&self) -> MetricKind {
        self.shape.kind
    }

    /// Typed handle
    pub fn handle(&self) -> &InstrumentHandle {
        &self.handle
    }

    /// Delete the sub-series matching `labels`; returns whether it existed
    pub fn remove(&self, labels: &HashMap<&str, &str>) -> bool {
        let removed = match &self.handle {
            InstrumentHandle::Counter(v) => v.remove(labels).is_ok(),
            InstrumentHandle::Gauge(v) => v.remove(labels).is_ok(),
            InstrumentHandle::Histogram(v) => v.remove(labels).is_ok(),
            InstrumentHandle::Summary(v) => v.remove(labels).unwrap_or(false),
        };
        if !removed {
            debug!(name = %self.name, ?labels, "No sub-series to remove");
        }
        removed
    }

    /// Delete every sub-series
    pub fn reset(&self) {
        match &self.handle {
            InstrumentHandle::Counter(v) => v.reset(),
            InstrumentHandle::Gauge(v) => v.reset(),
            InstrumentHandle::Histogram(v) => v.reset(),
            InstrumentHandle::Summary(v) => v.reset(),
        }
    }
}

/// Process-wide registry of named instruments
pub struct InstrumentRegistry {
    /// Backing prometheus registry (everything except summaries)
    registry: Registry,
    /// Instruments by name
    instruments: RwLock<HashMap<String, Arc<Instrument>>>,
    /// Metric names exported by registered collectors
    collected: RwLock<HashSet<String>>,
    /// Bucket and quantile settings for new instruments
    options: InstrumentOptions,
}

impl InstrumentRegistry {
    /// Create an empty registry
    pub fn new(options: InstrumentOptions) -> Self {
        Self {
            registry: Registry::new(),
            instruments: RwLock::new(HashMap::new()),
            collected: RwLock::new(HashSet::new()),
            options,
        }
    }

    /// Create a registry with the built-in process metrics registered
    pub fn with_process_metrics(options: InstrumentOptions) -> Result<Self> {
        let registry = Self::new(options);
        registry.register_process_metrics()?;
        Ok(registry)
    }

    /// Register CPU, memory, file descriptor and start-time metrics of this
    /// process. Only available on Linux; a no-op elsewhere.
    pub fn register_process_metrics(&self) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let collector = prometheus::process_collector::ProcessCollector::for_self();
            self.register_collector(Box::new(collector))?;
        }
        Ok(())
    }

    /// Register a collector next to the instruments.
    ///
    /// Its metric names are claimed like instrument names: a collector whose
    /// name is already used by an instrument fails with `AlreadyReg`, and
    /// later instruments with one of its names are rejected.
    pub fn register_collector(&self, collector: Box<dyn Collector>) -> Result<()> {
        // Hold the write lock so no instrument is created in between
        let instruments = self.instruments.write();
        let names: Vec<String> = collector.desc().iter().map(|d| d.fq_name.clone()).collect();
        if let Some(name) = names.iter().find(|n| instruments.contains_key(n.as_str())) {
            debug!(name = %name, "Collector name already used by an instrument");
            return Err(Error::Prometheus(prometheus::Error::AlreadyReg));
        }
        self.registry.register(collector)?;
        self.collected.write().extend(names);
        Ok(())
    }

    /// Whether `name` is exported by a registered collector
    fn is_collected_elsewhere(&self, name: &str) -> bool {
        self.collected.read().contains(name)
    }

    /// Options applied to new instruments
    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    /// Look up an instrument by name
    pub fn get(&self, name: &str) -> Option<Arc<Instrument>> {
        self.instruments.read().get(name).cloned()
    }

    /// Number of registered instruments
    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    /// Whether no instrument has been created yet
    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }

    /// Return the instrument called `name`, creating it with the given shape
    /// and the placeholder help text if it does not exist.
    pub fn get_or_create<S: AsRef<str>>(
        &self,
        name: &str,
        kind: MetricKind,
        label_names: &[S],
    ) -> Result<Arc<Instrument>> {
        self.get_or_create_with_help(name, kind, label_names, DEFAULT_HELP)
    }

    /// Like [`get_or_create`](Self::get_or_create) with explicit help text.
    ///
    /// Help text only applies on creation. Creation happens under the write
    /// lock, so concurrent first references yield a single instrument.
    pub fn get_or_create_with_help<S: AsRef<str>>(
        &self,
        name: &str,
        kind: MetricKind,
        label_names: &[S],
        help: &str,
    ) -> Result<Arc<Instrument>> {
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }

        let requested = Shape::new(kind, label_names.iter().map(|l| l.as_ref().to_string()));

        if let Some(existing) = self.instruments.read().get(name) {
            return Self::check_shape(existing, requested);
        }

        let mut instruments = self.instruments.write();
        if let Some(existing) = instruments.get(name) {
            return Self::check_shape(existing, requested);
        }

        let handle = self.build(name, help, &requested)?;
        let instrument = Arc::new(Instrument {
            name: name.to_string(),
            shape: requested,
            handle,
        });
        instruments.insert(name.to_string(), Arc::clone(&instrument));

        debug!(name, shape = %instrument.shape, "Instrument created");
        Ok(instrument)
    }

    fn check_shape(existing: &Arc<Instrument>, requested: Shape) -> Result<Arc<Instrument>> {
        if existing.shape == requested {
            Ok(Arc::clone(existing))
        } else {
            Err(Error::ShapeConflict {
                name: existing.name.clone(),
                existing: existing.shape.clone(),
                requested,
            })
        }
    }

    /// Construct and register the backing collector for a new instrument
    fn build(&self, name: &str, help: &str, shape: &Shape) -> Result<InstrumentHandle> {
        let labels: Vec<&str> = shape.label_names.iter().map(String::as_str).collect();

        let handle = match shape.kind {
            MetricKind::Counter => {
                let vec = CounterVec::new(Opts::new(name, help), &labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                InstrumentHandle::Counter(vec)
            }
            MetricKind::Gauge => {
                let vec = GaugeVec::new(Opts::new(name, help), &labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                InstrumentHandle::Gauge(vec)
            }
            MetricKind::Histogram => {
                if labels.contains(&"le") {
                    return Err(Error::Prometheus(prometheus::Error::Msg(
                        "`le` is not allowed as label name in histograms".to_string(),
                    )));
                }
                let opts = HistogramOpts::new(name, help)
                    .buckets(self.options.histogram_buckets.clone());
                let vec = HistogramVec::new(opts, &labels)?;
                self.registry.register(Box::new(vec.clone()))?;
                InstrumentHandle::Histogram(vec)
            }
            MetricKind::Summary => {
                // Summaries live outside the prometheus registry; check collector names
                if self.is_collected_elsewhere(name) {
                    return Err(Error::Prometheus(prometheus::Error::AlreadyReg));
                }
                InstrumentHandle::Summary(Arc::new(SummaryVec::new(
                    name,
                    help,
                    &shape.label_names,
                    self.options.summary.clone(),
                )?))
            }
        };

        Ok(handle)
    }

    /// Render every instrument in text exposition format.
    ///
    /// Each instrument is read under its own lock, so a render concurrent
    /// with a dispatch sees any single instrument either before or after the
    /// update. Instruments without sub-series are omitted.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        let mut output = String::from_utf8(buffer)
            .map_err(|e| Error::Encoding(format!("Metrics contain invalid UTF-8: {}", e)))?;

        let summaries: Vec<Arc<SummaryVec>> = {
            let instruments = self.instruments.read();
            let mut named: Vec<(&String, Arc<SummaryVec>)> = instruments
                .iter()
                .filter_map(|(name, i)| match &i.handle {
                    InstrumentHandle::Summary(s) => Some((name, Arc::clone(s))),
                    _ => None,
                })
                .collect();
            named.sort_by(|a, b| a.0.cmp(b.0));
            named.into_iter().map(|(_, s)| s).collect()
        };

        for summary in &summaries {
            summary.encode_text(&mut output);
        }

        Ok(output)
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new(InstrumentOptions::default())
    }
}
