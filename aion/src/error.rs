//! Error types for the aion storage core.
use thiserror::Error;

/// The primary error type for operations within this library.
#[derive(Error, Debug)]
pub enum AionError {
    /// Wraps a failure reported by the underlying store client (I/O, protocol,
    /// throttling). The core never retries these.
    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// A bucket column could not be decoded: bad format tag, truncated or
    /// overlong varint, or a missing time column.
    #[error("Decode error in column '{column}': {reason}")]
    Decode { column: String, reason: String },

    /// A binary attribute stored as base64 text was not valid base64.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Everything that went wrong while reading one bucket of a range query.
    /// Emission for that bucket stopped; the scan moved on.
    #[error("Bucket starting at {start} unreadable: {source}")]
    Bucket {
        start: i64,
        #[source]
        source: Box<AionError>,
    },

    /// A cache field held text that is not a number.
    #[error("Unable to parse cache field '{field}' value {value:?}: {reason}")]
    FieldParse {
        field: String,
        value: String,
        reason: String,
    },

    /// Some of the independent bucket or record writes of a batch failed.
    #[error("{} of {attempted} writes failed", failures.len())]
    PartialWrite {
        attempted: usize,
        failures: Vec<WriteFailure>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The attribute name collides with a key or time column.
    #[error("Attribute name '{0}' is reserved")]
    ReservedAttribute(String),

    /// An attribute is missing from an entry that precedes other entries
    /// carrying it within the same bucket.
    #[error("Attribute '{attribute}' has a gap inside bucket starting at {start}")]
    SparseAttribute { attribute: String, start: i64 },

    /// A value is NaN, infinite, or too large to quantize at the store's
    /// multiplier.
    #[error("Attribute '{attribute}' value {value} at {timestamp} cannot be quantized")]
    UnrepresentableValue {
        attribute: String,
        timestamp: i64,
        value: f64,
    },

    #[error("Timestamp {0} is outside the representable range")]
    TimestampOutOfRange(i64),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One failed unit (bucket or cache record) of a batched write, keyed by its
/// unix-seconds start or timestamp.
#[derive(Debug)]
pub struct WriteFailure {
    pub key: i64,
    pub error: AionError,
}

impl AionError {
    pub(crate) fn decode<C: Into<String>, R: Into<String>>(column: C, reason: R) -> Self {
        AionError::Decode {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Collapses a batch of write failures into `Ok` or a `PartialWrite`.
    pub(crate) fn from_failures(attempted: usize, failures: Vec<WriteFailure>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AionError::PartialWrite {
                attempted,
                failures,
            })
        }
    }
}

/// A convenience type alias for `Result<T, AionError>`.
pub type Result<T, E = AionError> = std::result::Result<T, E>;
