//! Error taxonomy for the partitioned scan path.
//!
//! Planning failures abort the whole scan; read failures are scoped to one
//! partition; conversion failures are always fatal for the row in progress.
//! Silent truncation or lossy fallback conversion is never acceptable.

use datafusion::common::DataFusionError;
use span_store::ClientError;
use thiserror::Error;

/// A source value that cannot be represented losslessly at the target type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// The raw value's shape does not match the declared column type.
    #[error("column type {expected} cannot accept {actual}")]
    TypeMismatch {
        expected: String,
        actual: &'static str,
    },
    /// A string-encoded literal failed to parse for its declared type.
    #[error("invalid {kind} literal {text:?}: {reason}")]
    InvalidLiteral {
        kind: &'static str,
        text: String,
        reason: String,
    },
    /// A decimal carries more fractional digits than the declared scale.
    #[error("numeric {text:?} has {fractional} fractional digits but the column declares scale {scale}")]
    NumericScale {
        text: String,
        fractional: usize,
        scale: i8,
    },
    /// A decimal's integer part exceeds what the declared precision permits.
    #[error("numeric {text:?} does not fit precision {precision} at scale {scale}")]
    NumericPrecision {
        text: String,
        precision: u8,
        scale: i8,
    },
    /// A row arrived with the wrong number of columns.
    #[error("row has {actual} values but the schema declares {expected} columns")]
    ColumnCount { expected: usize, actual: usize },
}

/// Scan-path error taxonomy surfaced to the host engine.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The database cannot be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// The fixed-timestamp snapshot cannot be opened or reopened.
    #[error("transaction error: {0}")]
    Transaction(String),
    /// The statement cannot be split into partitions.
    #[error("partition error: {0}")]
    Partition(String),
    /// Table metadata names a type this connector cannot map.
    #[error("schema error: {0}")]
    Schema(String),
    /// A value cannot be converted losslessly.
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),
}

impl From<ClientError> for ScanError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connection(msg) => Self::Connection(msg),
            ClientError::Transaction(msg) => Self::Transaction(msg),
            ClientError::Partition(msg) => Self::Partition(msg),
        }
    }
}

/// Adapts a scan error to DataFusion's error type at the provider boundary.
pub(crate) fn df_external(err: ScanError) -> DataFusionError {
    DataFusionError::External(Box::new(err))
}
