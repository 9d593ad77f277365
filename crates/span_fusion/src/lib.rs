//! Partitioned snapshot scans from Spanner-compatible databases into
//! DataFusion.
//!
//! The scan path has three stages:
//! - [`scanner::Scanner`] opens a strong-bound snapshot, splits the
//!   full-table statement into serializable [`span_store::PartitionDescriptor`]s,
//!   and releases the live handle;
//! - [`reader::PartitionReader`]s reopen the snapshot by identity on any
//!   process and drain one partition each, converting rows losslessly;
//! - [`provider::SpanTableProvider`] exposes the whole path as a DataFusion
//!   table, one output partition per descriptor.

pub mod config;
pub mod convert;
pub mod error;
pub mod provider;
pub mod reader;
pub mod scanner;
pub mod schema;

pub use config::ConnectOptions;
pub use error::{ConversionError, ScanError};
pub use provider::{PartitionScanExec, SpanTableProvider};
pub use reader::{PartitionReader, PartitionReaderFactory};
pub use scanner::{ScanOptions, ScanPlan, Scanner};
pub use schema::{ColumnSchema, ColumnType};
