//! Batch read-only client surface for Spanner-compatible databases.
//!
//! This crate defines the capability a scan planner needs from the database:
//! open a read-only snapshot at a strong timestamp bound, split a statement
//! into opaque partition tokens, and later re-execute a single token against
//! the same snapshot from any process, identified only by the snapshot's
//! transaction identity. No live session handle ever crosses a process
//! boundary; descriptors carry identities, not connections.
//!
//! The [`emulator`] module provides an in-process implementation of
//! [`BatchReadClient`] backed by versioned in-memory tables, used by tests
//! and local development in place of a real deployment.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod emulator;

/// Errors surfaced by the batch read client capability.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The database cannot be reached at all.
    #[error("database unreachable: {0}")]
    Connection(String),
    /// The fixed-timestamp snapshot cannot be opened or reopened,
    /// including identity expiry.
    #[error("snapshot transaction unavailable: {0}")]
    Transaction(String),
    /// The statement cannot be split into partitions, for example an
    /// unknown table, an unsupported query shape, or missing authorization.
    #[error("statement cannot be partitioned: {0}")]
    Partition(String),
}

/// Column-type vocabulary variant a database speaks.
///
/// The dialect is fixed per database and affects both type-name resolution
/// and identifier quoting in generated statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// The standard GoogleSQL vocabulary (`INT64`, `STRING(MAX)`, ...).
    GoogleSql,
    /// The PostgreSQL-compatible vocabulary (`bigint`, `character varying`, ...).
    Postgres,
}

/// Fully resolved identity of one scannable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub instance: String,
    pub database: String,
    pub table: String,
    pub dialect: Dialect,
}

impl TableRef {
    /// Renders the table name quoted for the database's dialect.
    pub fn quoted_table(&self) -> String {
        match self.dialect {
            Dialect::GoogleSql => format!("`{}`", self.table),
            Dialect::Postgres => format!("\"{}\"", self.table),
        }
    }
}

/// One column as reported by the database's table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRecord {
    /// Column name in declaration order.
    pub name: String,
    /// Dialect-specific type name, e.g. `NUMERIC` or `character varying`.
    pub type_name: String,
    /// Whether the column admits SQL NULL.
    pub nullable: bool,
}

/// Timestamp bound requested when opening a read-only snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBound {
    /// Read at a timestamp where all previously committed writes are visible.
    Strong,
    /// Read at a timestamp at most this far in the past.
    ExactStaleness(Duration),
}

/// Opaque identity of a read-only snapshot transaction.
///
/// The identity stays valid for re-execution after the live handle that
/// created it is released, until the database expires the transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live, session-backed snapshot handle.
///
/// Handles are not serializable and must be released by the process that
/// opened them; only the contained [`SnapshotId`] may travel further.
#[derive(Debug)]
pub struct SnapshotHandle {
    pub id: SnapshotId,
}

/// Opaque, database-issued token for one slice of a split query.
///
/// Meaningless outside the snapshot identity it was created under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionToken(Vec<u8>);

impl PartitionToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Serializable description of one independently executable partition.
///
/// The set of descriptors produced by one planning call, read and unioned,
/// yields exactly the planned query's result set with no duplicate and no
/// missing row. Descriptors are immutable and safe to ship across process
/// boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    /// Database-issued partition token.
    pub token: PartitionToken,
    /// Identity of the snapshot the token belongs to.
    pub snapshot: SnapshotId,
    /// 0-based ordinal within the planning call, for diagnostics only.
    pub index: usize,
}

/// Options forwarded to the partitioning call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionQueryOptions {
    /// Request elevated read parallelism at higher resource cost,
    /// independent of the transactional serving path.
    pub data_boost: bool,
}

/// One raw value as it arrives on the wire.
///
/// Numerics, dates, and timestamps travel as strings; the conversion layer
/// upstream is responsible for lossless interpretation. Arrays nest
/// arbitrarily and may contain nulls at any level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Exact decimal rendered as a plain decimal string, e.g. `-12.3400`.
    Numeric(String),
    /// Calendar date rendered as `YYYY-MM-DD`.
    Date(String),
    /// Absolute instant rendered as RFC 3339 with an arbitrary offset.
    Timestamp(String),
    /// JSON document passed through as text.
    Json(String),
    Array(Vec<RawValue>),
}

/// One raw row in schema column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub values: Vec<RawValue>,
}

impl RawRow {
    pub fn new(values: Vec<RawValue>) -> Self {
        Self { values }
    }
}

/// Streaming result of executing one partition token.
pub type RawRowStream = Pin<Box<dyn Stream<Item = Result<RawRow, ClientError>> + Send>>;

/// Read-only batch access to a Spanner-compatible database.
///
/// Implementations own all session/RPC state. Callers follow the lifecycle:
/// open a snapshot, split a statement under the live handle, release the
/// handle, then re-execute individual tokens from any process using only the
/// snapshot identity.
#[async_trait]
pub trait BatchReadClient: Send + Sync {
    /// Returns the column metadata for a table in declaration order.
    async fn table_schema(&self, table: &TableRef) -> Result<Vec<ColumnRecord>, ClientError>;

    /// Opens a read-only snapshot at the requested timestamp bound.
    async fn create_snapshot(&self, bound: TimestampBound) -> Result<SnapshotHandle, ClientError>;

    /// Splits `sql` into opaque partition tokens under a live snapshot handle.
    ///
    /// The returned tokens are only meaningful together with the handle's
    /// snapshot identity.
    async fn partition_query(
        &self,
        handle: &SnapshotHandle,
        sql: &str,
        options: &PartitionQueryOptions,
    ) -> Result<Vec<PartitionToken>, ClientError>;

    /// Releases a live snapshot handle.
    ///
    /// The snapshot identity remains servable for partition execution until
    /// the database expires it.
    async fn release_snapshot(&self, handle: SnapshotHandle) -> Result<(), ClientError>;

    /// Reopens read-only access by snapshot identity and executes exactly
    /// one partition's sub-query, yielding raw rows lazily.
    async fn execute_partition(
        &self,
        snapshot: &SnapshotId,
        token: &PartitionToken,
    ) -> Result<RawRowStream, ClientError>;
}
