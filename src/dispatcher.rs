//! Operation dispatcher
//!
//! Routes each decoded [`OperationRecord`] to the instrument it names,
//! creating the instrument on first reference. Malformed or conflicting
//! records are dropped and counted; they never stop the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::{Instrument, InstrumentHandle, InstrumentRegistry, Shape};
use crate::types::{
    CounterOp, GaugeOp, HistogramOp, Operation, OperationRecord, SummaryOp,
};

/// Result of dispatching one record
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The mutation was applied
    Applied,
    /// The record was dropped; the error says why
    Ignored(Error),
}

impl DispatchOutcome {
    /// Whether the mutation was applied
    pub fn is_applied(&self) -> bool {
        matches!(self, DispatchOutcome::Applied)
    }
}

/// Dispatch counters, updated atomically
#[derive(Debug, Default)]
pub struct DispatchStats {
    applied: AtomicU64,
    unrecognized: AtomicU64,
    conflicts: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    /// Operations applied
    pub applied: u64,
    /// Operations dropped for an unknown operation code
    pub unrecognized: u64,
    /// Operations dropped for a shape conflict
    pub conflicts: u64,
    /// Operations dropped for any other reason
    pub rejected: u64,
}

impl DispatchSnapshot {
    /// Operations seen in total
    pub fn total(&self) -> u64 {
        self.applied + self.unrecognized + self.conflicts + self.rejected
    }
}

impl DispatchStats {
    fn record(&self, outcome: &DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Applied => &self.applied,
            DispatchOutcome::Ignored(Error::UnrecognizedOperation { .. }) => &self.unrecognized,
            DispatchOutcome::Ignored(Error::ShapeConflict { .. }) => &self.conflicts,
            DispatchOutcome::Ignored(_) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_undecodable(&self, count: u64) {
        self.rejected.fetch_add(count, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Identifies one sub-series: instrument name plus label values by label name
type SeriesKey = (String, Vec<String>);

/// Applies operation records to the registry
pub struct OperationDispatcher {
    registry: Arc<InstrumentRegistry>,
    /// Running START_TIMER measurements
    timers: Mutex<HashMap<SeriesKey, Instant>>,
    stats: DispatchStats,
}

impl OperationDispatcher {
    /// Create a dispatcher writing into `registry`
    pub fn new(registry: Arc<InstrumentRegistry>) -> Self {
        Self {
            registry,
            timers: Mutex::new(HashMap::new()),
            stats: DispatchStats::default(),
        }
    }

    /// Registry this dispatcher writes into
    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    /// Dispatch counters
    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Count records the source dropped before they could be dispatched.
    /// They are reported as rejected.
    pub fn record_undecodable(&self, count: u64) {
        if count > 0 {
            debug!(count, "Undecodable records dropped");
            self.stats.record_undecodable(count);
        }
    }

    /// Number of START_TIMER measurements still running
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Apply one record.
    ///
    /// Never fails: dropped records are logged, counted and returned as
    /// [`DispatchOutcome::Ignored`].
    pub fn dispatch(&self, record: &OperationRecord) -> DispatchOutcome {
        let outcome = match self.try_dispatch(record) {
            Ok(()) => {
                info!(
                    name = %record.name,
                    labels = ?record.labels,
                    kind = %record.kind,
                    operation = record.operation_code,
                    value = record.value,
                    "Operation applied"
                );
                DispatchOutcome::Applied
            }
            Err(e) => {
                match &e {
                    Error::UnrecognizedOperation { kind, code } => {
                        debug!(name = %record.name, %kind, code, "Unrecognized operation skipped");
                    }
                    _ => {
                        warn!(name = %record.name, labels = ?record.labels, error = %e, "Operation dropped");
                    }
                }
                DispatchOutcome::Ignored(e)
            }
        };
        self.stats.record(&outcome);
        outcome
    }

    /// Apply one record, reporting why it could not be applied
    pub fn try_dispatch(&self, record: &OperationRecord) -> Result<()> {
        if record.name.is_empty() {
            return Err(Error::MissingField("name"));
        }

        // Decode first: an unknown code must not create an instrument
        let operation = record.operation()?;
        let instrument = self.resolve(record, &operation)?;

        match (operation, instrument.handle()) {
            (Operation::Counter(op), InstrumentHandle::Counter(vec)) => {
                self.apply_counter(record, op, &instrument, vec)
            }
            (Operation::Gauge(op), InstrumentHandle::Gauge(vec)) => {
                self.apply_gauge(record, op, &instrument, vec)
            }
            (Operation::Histogram(op), InstrumentHandle::Histogram(_)) => {
                self.apply_histogram(record, op, &instrument)
            }
            (Operation::Summary(op), InstrumentHandle::Summary(_)) => {
                self.apply_summary(record, op, &instrument)
            }
            // Only reachable when a label-less RESET names an instrument of another kind
            _ => Err(Error::ShapeConflict {
                name: record.name.clone(),
                existing: instrument.shape().clone(),
                requested: Shape::new(record.kind, record.label_names()),
            }),
        }
    }

    /// Find or create the target instrument.
    ///
    /// A label-less RESET targets the existing instrument of that name and
    /// kind whatever its label names are.
    fn resolve(&self, record: &OperationRecord, operation: &Operation) -> Result<Arc<Instrument>> {
        if operation.is_reset() && record.labels.is_empty() {
            if let Some(existing) = self.registry.get(&record.name) {
                if existing.kind() == record.kind {
                    return Ok(existing);
                }
            }
        }
        self.registry
            .get_or_create(&record.name, record.kind, &record.label_names())
    }

    fn apply_counter(
        &self,
        record: &OperationRecord,
        op: CounterOp,
        instrument: &Instrument,
        vec: &prometheus::CounterVec,
    ) -> Result<()> {
        let labels = record.label_refs();
        match op {
            CounterOp::Inc => vec.get_metric_with(&labels)?.inc(),
            CounterOp::Add => {
                if !record.value.is_finite() || record.value < 0.0 {
                    return Err(Error::InvalidValue {
                        name: record.name.clone(),
                        value: record.value,
                        reason: "counters can only increase by a finite non-negative amount",
                    });
                }
                vec.get_metric_with(&labels)?.inc_by(record.value)
            }
            CounterOp::Remove => {
                instrument.remove(&labels);
            }
            CounterOp::Reset => instrument.reset(),
        }
        Ok(())
    }

    fn apply_gauge(
        &self,
        record: &OperationRecord,
        op: GaugeOp,
        instrument: &Instrument,
        vec: &prometheus::GaugeVec,
    ) -> Result<()> {
        let labels = record.label_refs();
        match op {
            GaugeOp::Inc => vec.get_metric_with(&labels)?.inc(),
            GaugeOp::Dec => vec.get_metric_with(&labels)?.dec(),
            GaugeOp::Add => vec.get_metric_with(&labels)?.add(Self::value(record)?),
            GaugeOp::Sub => vec.get_metric_with(&labels)?.sub(Self::value(record)?),
            GaugeOp::Set => vec.get_metric_with(&labels)?.set(Self::value(record)?),
            GaugeOp::SetToCurrentTime => vec.get_metric_with(&labels)?.set(unix_now_secs()),
            GaugeOp::Remove => {
                instrument.remove(&labels);
            }
            GaugeOp::Reset => instrument.reset(),
        }
        Ok(())
    }

    fn apply_histogram(
        &self,
        record: &OperationRecord,
        op: HistogramOp,
        instrument: &Instrument,
    ) -> Result<()> {
        let labels = record.label_refs();
        match op {
            HistogramOp::Observe => self.observe(instrument, &labels, Self::value(record)?)?,
            HistogramOp::StartTimer => self.start_timer(record, instrument)?,
            HistogramOp::Zero => {
                if let InstrumentHandle::Histogram(vec) = instrument.handle() {
                    vec.get_metric_with(&labels)?;
                }
            }
            HistogramOp::Remove => {
                self.discard_timer(record);
                instrument.remove(&labels);
            }
            HistogramOp::Reset => {
                self.discard_timers(&record.name);
                instrument.reset();
            }
        }
        Ok(())
    }

    fn apply_summary(
        &self,
        record: &OperationRecord,
        op: SummaryOp,
        instrument: &Instrument,
    ) -> Result<()> {
        let labels = record.label_refs();
        match op {
            SummaryOp::Observe => self.observe(instrument, &labels, Self::value(record)?)?,
            SummaryOp::StartTimer => self.start_timer(record, instrument)?,
            SummaryOp::Remove => {
                self.discard_timer(record);
                instrument.remove(&labels);
            }
            SummaryOp::Reset => {
                self.discard_timers(&record.name);
                instrument.reset();
            }
        }
        Ok(())
    }

    /// Record an observation into a histogram or summary
    fn observe(
        &self,
        instrument: &Instrument,
        labels: &HashMap<&str, &str>,
        value: f64,
    ) -> Result<()> {
        match instrument.handle() {
            InstrumentHandle::Histogram(vec) => vec.get_metric_with(labels)?.observe(value),
            InstrumentHandle::Summary(summary) => summary.observe(labels, value)?,
            _ => {}
        }
        Ok(())
    }

    /// Start a measurement for the series. A measurement already running for
    /// the same series is completed first and its elapsed seconds observed.
    fn start_timer(&self, record: &OperationRecord, instrument: &Instrument) -> Result<()> {
        let labels = record.label_refs();
        let key = (record.name.clone(), record.series_key());
        let now = Instant::now();

        let previous = self.timers.lock().insert(key, now);
        match previous {
            Some(started) => {
                let elapsed = now.saturating_duration_since(started).as_secs_f64();
                self.observe(instrument, &labels, elapsed)
            }
            None => {
                // Materialize the series so it shows up before the first completion
                if let InstrumentHandle::Histogram(vec) = instrument.handle() {
                    vec.get_metric_with(&labels)?;
                }
                Ok(())
            }
        }
    }

    fn discard_timer(&self, record: &OperationRecord) {
        let key = (record.name.clone(), record.series_key());
        self.timers.lock().remove(&key);
    }

    fn discard_timers(&self, name: &str) {
        self.timers.lock().retain(|(timer_name, _), _| timer_name != name);
    }

    fn value(record: &OperationRecord) -> Result<f64> {
        if record.value.is_nan() {
            return Err(Error::InvalidValue {
                name: record.name.clone(),
                value: record.value,
                reason: "value is NaN",
            });
        }
        Ok(record.value)
    }
}

/// Wall-clock seconds since the Unix epoch
pub(crate) fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
