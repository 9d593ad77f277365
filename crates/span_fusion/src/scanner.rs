//! Scan planning against a fixed read snapshot.
//!
//! Planning opens a snapshot at a strong timestamp bound, splits the
//! full-table statement into partition tokens, and releases the live handle
//! before returning. Only the snapshot identity travels inside the returned
//! descriptors; readers reopen it on whatever process they land on.

use std::sync::Arc;

use span_store::{
    BatchReadClient, PartitionDescriptor, PartitionQueryOptions, TableRef, TimestampBound,
};
use tracing::info;

use crate::error::ScanError;
use crate::schema::{arrow_schema, derive_schema, ColumnSchema};

/// Per-scan knobs beyond the table identity.
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Runs partition reads on isolated compute capacity when available.
    pub data_boost: bool,
}

/// Output of planning: everything a set of independent readers needs.
#[derive(Clone, Debug)]
pub struct ScanPlan {
    /// Derived column schema, in table order.
    pub columns: Vec<ColumnSchema>,
    /// Arrow rendering of [`Self::columns`].
    pub schema: datafusion::arrow::datatypes::SchemaRef,
    /// Partition descriptors; their union is the exact table contents at the
    /// snapshot timestamp, with no duplicates.
    pub partitions: Vec<PartitionDescriptor>,
}

/// Plans partitioned snapshot scans over one table.
pub struct Scanner {
    client: Arc<dyn BatchReadClient>,
    table: TableRef,
}

impl Scanner {
    pub fn new(client: Arc<dyn BatchReadClient>, table: TableRef) -> Self {
        Self { client, table }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Full-table statement submitted for partitioning. Filters and
    /// projections are applied engine-side, never pushed into the statement.
    pub fn select_all_sql(&self) -> String {
        format!("SELECT * FROM {}", self.table.quoted_table())
    }

    /// Plans one scan: derive the schema, open a strong-bound snapshot,
    /// partition the statement, and release the live handle.
    ///
    /// Planning is all or nothing. Any failure aborts the scan before
    /// descriptors exist, so no reader can observe a partial plan.
    pub async fn plan(&self, options: &ScanOptions) -> Result<ScanPlan, ScanError> {
        let records = self.client.table_schema(&self.table).await?;
        let columns = derive_schema(self.table.dialect, &records)?;
        let schema = arrow_schema(&columns);

        let handle = self.client.create_snapshot(TimestampBound::Strong).await?;
        let query_options = PartitionQueryOptions {
            data_boost: options.data_boost,
        };
        let sql = self.select_all_sql();
        let tokens = match self.client.partition_query(&handle, &sql, &query_options).await {
            Ok(tokens) => tokens,
            Err(err) => {
                // The handle must not leak even when partitioning fails.
                let _ = self.client.release_snapshot(handle).await;
                return Err(err.into());
            }
        };
        let snapshot = handle.id.clone();
        self.client.release_snapshot(handle).await?;

        let partitions: Vec<PartitionDescriptor> = tokens
            .into_iter()
            .enumerate()
            .map(|(index, token)| PartitionDescriptor {
                token,
                snapshot: snapshot.clone(),
                index,
            })
            .collect();

        info!(
            table = %self.table.table,
            snapshot = %snapshot,
            partitions = partitions.len(),
            data_boost = options.data_boost,
            "planned partitioned scan"
        );

        Ok(ScanPlan {
            columns,
            schema,
            partitions,
        })
    }
}
