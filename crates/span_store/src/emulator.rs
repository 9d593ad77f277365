//! In-process emulator implementing [`BatchReadClient`] over in-memory tables.
//!
//! The emulator preserves the semantics the scan path depends on: snapshots
//! freeze a copy of the data at creation time, partition tokens are opaque
//! byte blobs only servable under their snapshot identity, and releasing the
//! live handle does not invalidate that identity. Fault-injection switches
//! cover the failure modes a real deployment exhibits.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    BatchReadClient, ClientError, ColumnRecord, PartitionQueryOptions, PartitionToken, RawRow,
    RawRowStream, SnapshotHandle, SnapshotId, TableRef, TimestampBound,
};

/// Default upper bound on tokens produced per partitioning call.
const DEFAULT_MAX_PARTITIONS: usize = 4;

/// One emulated table: declared columns plus rows in insertion order.
#[derive(Debug, Clone)]
struct EmulatedTable {
    columns: Vec<ColumnRecord>,
    rows: Vec<RawRow>,
}

/// Opaque token payload; an implementation detail of the emulator.
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    table: String,
    start: usize,
    end: usize,
}

#[derive(Debug, Default)]
struct EmulatorState {
    tables: BTreeMap<String, EmulatedTable>,
    /// Frozen table views keyed by snapshot identity.
    snapshots: BTreeMap<SnapshotId, BTreeMap<String, EmulatedTable>>,
    /// Identities with a live (unreleased) handle.
    live_handles: BTreeSet<SnapshotId>,
    /// Identities forcibly expired by fault injection.
    expired: BTreeSet<SnapshotId>,
    next_snapshot: u64,
    max_partitions: usize,
    fail_connections: bool,
    fail_partitioning: bool,
    last_data_boost: Option<bool>,
}

/// In-memory [`BatchReadClient`] with explicit fixture and fault controls.
#[derive(Clone)]
pub struct EmulatorClient {
    state: Arc<Mutex<EmulatorState>>,
    open_streams: Arc<AtomicUsize>,
}

impl Default for EmulatorClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatorClient {
    pub fn new() -> Self {
        let state = EmulatorState {
            max_partitions: DEFAULT_MAX_PARTITIONS,
            ..EmulatorState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a table with the given column metadata, replacing any previous
    /// definition of the same name.
    pub fn create_table(&self, name: impl Into<String>, columns: Vec<ColumnRecord>) {
        let mut state = self.lock();
        state.tables.insert(
            name.into(),
            EmulatedTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Appends rows to an existing table. Panics on an unknown table because
    /// fixtures are test-controlled.
    pub fn insert_rows(&self, name: &str, rows: Vec<RawRow>) {
        let mut state = self.lock();
        let table = state
            .tables
            .get_mut(name)
            .unwrap_or_else(|| panic!("emulator fixture table {name} does not exist"));
        table.rows.extend(rows);
    }

    /// Caps the number of tokens produced per partitioning call.
    pub fn set_max_partitions(&self, max_partitions: usize) {
        self.lock().max_partitions = max_partitions.max(1);
    }

    /// Makes every subsequent RPC fail with [`ClientError::Connection`].
    pub fn fail_connections(&self, fail: bool) {
        self.lock().fail_connections = fail;
    }

    /// Makes partitioning calls fail with [`ClientError::Partition`].
    pub fn fail_partitioning(&self, fail: bool) {
        self.lock().fail_partitioning = fail;
    }

    /// Expires a snapshot identity so re-execution fails with
    /// [`ClientError::Transaction`].
    pub fn expire_snapshot(&self, snapshot: &SnapshotId) {
        let mut state = self.lock();
        state.snapshots.remove(snapshot);
        state.live_handles.remove(snapshot);
        state.expired.insert(snapshot.clone());
    }

    /// Number of snapshot handles opened but not yet released.
    pub fn live_snapshot_handles(&self) -> usize {
        self.lock().live_handles.len()
    }

    /// Number of partition row streams currently open.
    pub fn open_row_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// The `data_boost` flag observed by the most recent partitioning call.
    pub fn last_data_boost(&self) -> Option<bool> {
        self.lock().last_data_boost
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_connection(state: &EmulatorState) -> Result<(), ClientError> {
        if state.fail_connections {
            return Err(ClientError::Connection(
                "emulator configured to refuse connections".to_string(),
            ));
        }
        Ok(())
    }
}

/// Extracts the table name from the `SELECT * FROM <table>` statements the
/// planner generates, stripping dialect quoting.
fn table_name_from_sql(sql: &str) -> Option<String> {
    let from = sql.rfind(" FROM ")?;
    let name = sql[from + " FROM ".len()..].trim();
    let name = name.trim_matches(|c| c == '`' || c == '"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[async_trait]
impl BatchReadClient for EmulatorClient {
    async fn table_schema(&self, table: &TableRef) -> Result<Vec<ColumnRecord>, ClientError> {
        let state = self.lock();
        Self::check_connection(&state)?;
        state
            .tables
            .get(&table.table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| ClientError::Partition(format!("table {} does not exist", table.table)))
    }

    async fn create_snapshot(&self, _bound: TimestampBound) -> Result<SnapshotHandle, ClientError> {
        let mut state = self.lock();
        Self::check_connection(&state)?;
        state.next_snapshot += 1;
        let id = SnapshotId::new(format!("snap-{:08}", state.next_snapshot));
        let frozen = state.tables.clone();
        state.snapshots.insert(id.clone(), frozen);
        state.live_handles.insert(id.clone());
        debug!(snapshot = %id, "emulator opened snapshot");
        Ok(SnapshotHandle { id })
    }

    async fn partition_query(
        &self,
        handle: &SnapshotHandle,
        sql: &str,
        options: &PartitionQueryOptions,
    ) -> Result<Vec<PartitionToken>, ClientError> {
        let mut state = self.lock();
        Self::check_connection(&state)?;
        state.last_data_boost = Some(options.data_boost);
        if state.fail_partitioning {
            return Err(ClientError::Partition(
                "emulator configured to refuse partitioning".to_string(),
            ));
        }
        if !state.live_handles.contains(&handle.id) {
            return Err(ClientError::Transaction(format!(
                "snapshot {} has no live handle",
                handle.id
            )));
        }
        let table_name = table_name_from_sql(sql)
            .ok_or_else(|| ClientError::Partition(format!("unsupported statement shape: {sql}")))?;
        let snapshot = state
            .snapshots
            .get(&handle.id)
            .ok_or_else(|| ClientError::Transaction(format!("unknown snapshot {}", handle.id)))?;
        let table = snapshot.get(&table_name).ok_or_else(|| {
            ClientError::Partition(format!("table {table_name} does not exist"))
        })?;

        let total = table.rows.len();
        let parts = state.max_partitions.min(total).max(1);
        let chunk = total.div_ceil(parts).max(1);
        let mut tokens = Vec::with_capacity(parts);
        let mut start = 0;
        loop {
            let end = (start + chunk).min(total);
            let payload = TokenPayload {
                table: table_name.clone(),
                start,
                end,
            };
            let bytes = serde_json::to_vec(&payload)
                .map_err(|e| ClientError::Partition(format!("encode partition token: {e}")))?;
            tokens.push(PartitionToken::new(bytes));
            start = end;
            if start >= total {
                break;
            }
        }
        Ok(tokens)
    }

    async fn release_snapshot(&self, handle: SnapshotHandle) -> Result<(), ClientError> {
        let mut state = self.lock();
        if !state.live_handles.remove(&handle.id) {
            return Err(ClientError::Transaction(format!(
                "snapshot {} is not live",
                handle.id
            )));
        }
        debug!(snapshot = %handle.id, "emulator released snapshot handle");
        Ok(())
    }

    async fn execute_partition(
        &self,
        snapshot: &SnapshotId,
        token: &PartitionToken,
    ) -> Result<RawRowStream, ClientError> {
        let state = self.lock();
        Self::check_connection(&state)?;
        if state.expired.contains(snapshot) {
            return Err(ClientError::Transaction(format!(
                "snapshot {snapshot} has expired"
            )));
        }
        let frozen = state
            .snapshots
            .get(snapshot)
            .ok_or_else(|| ClientError::Transaction(format!("unknown snapshot {snapshot}")))?;
        let payload: TokenPayload = serde_json::from_slice(token.as_bytes())
            .map_err(|e| ClientError::Partition(format!("malformed partition token: {e}")))?;
        let table = frozen.get(&payload.table).ok_or_else(|| {
            ClientError::Partition(format!("token references unknown table {}", payload.table))
        })?;
        if payload.start > payload.end || payload.end > table.rows.len() {
            return Err(ClientError::Partition(format!(
                "token range {}..{} out of bounds for {} rows",
                payload.start,
                payload.end,
                table.rows.len()
            )));
        }
        let rows = table.rows[payload.start..payload.end].to_vec();
        drop(state);
        Ok(Box::pin(TrackedRowStream::new(rows, self.open_streams.clone())))
    }
}

/// Row stream that keeps the emulator's open-stream count accurate, so tests
/// can observe prompt resource release on early close.
struct TrackedRowStream {
    rows: std::vec::IntoIter<RawRow>,
    counter: Arc<AtomicUsize>,
}

impl TrackedRowStream {
    fn new(rows: Vec<RawRow>, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            rows: rows.into_iter(),
            counter,
        }
    }
}

impl Drop for TrackedRowStream {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Stream for TrackedRowStream {
    type Item = Result<RawRow, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.rows.next().map(Ok))
    }
}
