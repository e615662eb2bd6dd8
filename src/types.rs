//! Core data types flowing from the ingestion source into the registry

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// Label name -> label value mapping carried by an operation
pub type LabelSet = HashMap<String, String>;

/// Kind of metric instrument an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic counter
    Counter,
    /// Arbitrary up/down value
    Gauge,
    /// Bucketed distribution
    Histogram,
    /// Sliding-window quantiles
    Summary,
}

impl MetricKind {
    /// Lowercase name as used in the exposition format
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw operation codes as they appear on the wire
pub mod op_code {
    pub const INC: i32 = 1;
    pub const ADD: i32 = 2;
    pub const SET: i32 = 3;
    pub const DEC: i32 = 4;
    pub const SUB: i32 = 5;
    pub const SET_TO_CURRENT_TIME: i32 = 6;
    pub const REMOVE: i32 = 7;
    pub const RESET: i32 = 8;

    pub const OBSERVE: i32 = 1;
    pub const START_TIMER: i32 = 2;
    pub const ZERO: i32 = 3;
}

/// One decoded metric operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Target instrument name
    pub name: String,
    /// Label values identifying the sub-series
    #[serde(default)]
    pub labels: LabelSet,
    /// Instrument kind
    pub kind: MetricKind,
    /// Requested mutation, interpreted per kind
    #[serde(alias = "operation")]
    pub operation_code: i32,
    /// Payload for add/set/observe style operations
    #[serde(default)]
    pub value: f64,
}

impl OperationRecord {
    /// Create a record without labels
    pub fn new(name: impl Into<String>, kind: MetricKind, operation_code: i32, value: f64) -> Self {
        Self {
            name: name.into(),
            labels: LabelSet::new(),
            kind,
            operation_code,
            value,
        }
    }

    /// Add a label to the record
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Label names sorted and deduplicated
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.labels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Label values ordered by label name; identifies one sub-series
    pub fn series_key(&self) -> Vec<String> {
        let sorted: BTreeMap<_, _> = self.labels.iter().collect();
        sorted.into_values().cloned().collect()
    }

    /// Borrowed view of the labels for prometheus lookups
    pub fn label_refs(&self) -> HashMap<&str, &str> {
        self.labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Decode the operation code against the record's kind
    pub fn operation(&self) -> Result<Operation> {
        Operation::decode(self.kind, self.operation_code)
    }
}

/// Counter mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    Inc,
    Add,
    Remove,
    Reset,
}

/// Gauge mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugeOp {
    Inc,
    Add,
    Set,
    Dec,
    Sub,
    SetToCurrentTime,
    Remove,
    Reset,
}

/// Histogram mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramOp {
    Observe,
    StartTimer,
    Zero,
    Remove,
    Reset,
}

/// Summary mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryOp {
    Observe,
    StartTimer,
    Remove,
    Reset,
}

/// A fully decoded operation: kind and code resolved together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Counter(CounterOp),
    Gauge(GaugeOp),
    Histogram(HistogramOp),
    Summary(SummaryOp),
}

impl Operation {
    /// Resolve a raw code for the given kind.
    ///
    /// Codes outside the closed set of the kind yield
    /// [`Error::UnrecognizedOperation`].
    pub fn decode(kind: MetricKind, code: i32) -> Result<Self> {
        use op_code::*;

        let op = match kind {
            MetricKind::Counter => match code {
                INC => Some(Operation::Counter(CounterOp::Inc)),
                ADD => Some(Operation::Counter(CounterOp::Add)),
                REMOVE => Some(Operation::Counter(CounterOp::Remove)),
                RESET => Some(Operation::Counter(CounterOp::Reset)),
                _ => None,
            },
            MetricKind::Gauge => match code {
                INC => Some(Operation::Gauge(GaugeOp::Inc)),
                ADD => Some(Operation::Gauge(GaugeOp::Add)),
                SET => Some(Operation::Gauge(GaugeOp::Set)),
                DEC => Some(Operation::Gauge(GaugeOp::Dec)),
                SUB => Some(Operation::Gauge(GaugeOp::Sub)),
                SET_TO_CURRENT_TIME => Some(Operation::Gauge(GaugeOp::SetToCurrentTime)),
                REMOVE => Some(Operation::Gauge(GaugeOp::Remove)),
                RESET => Some(Operation::Gauge(GaugeOp::Reset)),
                _ => None,
            },
            MetricKind::Histogram => match code {
                OBSERVE => Some(Operation::Histogram(HistogramOp::Observe)),
                START_TIMER => Some(Operation::Histogram(HistogramOp::StartTimer)),
                ZERO => Some(Operation::Histogram(HistogramOp::Zero)),
                REMOVE => Some(Operation::Histogram(HistogramOp::Remove)),
                RESET => Some(Operation::Histogram(HistogramOp::Reset)),
                _ => None,
            },
            MetricKind::Summary => match code {
                OBSERVE => Some(Operation::Summary(SummaryOp::Observe)),
                START_TIMER => Some(Operation::Summary(SummaryOp::StartTimer)),
                REMOVE => Some(Operation::Summary(SummaryOp::Remove)),
                RESET => Some(Operation::Summary(SummaryOp::Reset)),
                _ => None,
            },
        };

        op.ok_or(Error::UnrecognizedOperation { kind, code })
    }

    /// Whether this operation clears every sub-series of the instrument
    pub fn is_reset(&self) -> bool {
        matches!(
            self,
            Operation::Counter(CounterOp::Reset)
                | Operation::Gauge(GaugeOp::Reset)
                | Operation::Histogram(HistogramOp::Reset)
                | Operation::Summary(SummaryOp::Reset)
        )
    }
}

/// Progress marker emitted by the source once per processed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionClockSignal {
    /// Position in the source (block number)
    pub position: u64,
    /// Source timestamp for `position`, seconds since the Unix epoch
    pub timestamp_seconds: i64,
}

impl PositionClockSignal {
    /// Create a new signal
    pub fn new(position: u64, timestamp_seconds: i64) -> Self {
        Self {
            position,
            timestamp_seconds,
        }
    }
}

/// One unit of source progress: the operations it produced and its clock
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBlock {
    /// Clock of the block, if the source reports one
    #[serde(default)]
    pub clock: Option<PositionClockSignal>,
    /// Operations in arrival order
    #[serde(default)]
    pub operations: Vec<OperationRecord>,
    /// Records of this block the source could not decode and dropped
    #[serde(skip)]
    pub undecodable: u64,
}
