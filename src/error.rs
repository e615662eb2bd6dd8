//! Error types for the sink

use thiserror::Error;

use crate::registry::Shape;
use crate::types::MetricKind;

/// Main error type for the sink
#[derive(Error, Debug)]
pub enum Error {
    /// An instrument with this name exists with a different kind or label-name set
    #[error("Shape conflict for '{name}': registered as {existing}, requested {requested}")]
    ShapeConflict {
        /// Instrument name
        name: String,
        /// Shape stored in the registry
        existing: Shape,
        /// Shape carried by the rejected operation
        requested: Shape,
    },

    /// Operation code not defined for the metric kind
    #[error("Unrecognized operation code {code} for {kind}")]
    UnrecognizedOperation {
        /// Metric kind of the record
        kind: MetricKind,
        /// Raw operation code
        code: i32,
    },

    /// A required field of an operation record is missing or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The operation value cannot be applied to the instrument
    #[error("Invalid value {value} for '{name}': {reason}")]
    InvalidValue {
        /// Instrument name
        name: String,
        /// Rejected value
        value: f64,
        /// Why the value was rejected
        reason: &'static str,
    },

    /// Error reported by the prometheus client (invalid names, registration)
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Source record could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Exposition payload could not be produced
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl Error {
    /// Whether the pipeline may continue after this error.
    ///
    /// Per-record failures only cost the affected metric update; I/O and
    /// configuration failures end the run.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
