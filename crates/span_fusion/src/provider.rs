//! DataFusion integration: a table provider whose scans plan partitioned
//! snapshot reads, and the leaf physical operator that executes them.
//!
//! Each planned partition becomes one output partition of the physical plan,
//! so the engine schedules partition reads with its own parallelism. Filters
//! and limits stay engine-side; the source always serves the full table
//! contents at the snapshot timestamp.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::{Session, TableProvider};
use datafusion::common::{Result as DFResult, ScalarValue};
use datafusion::error::DataFusionError;
use datafusion::execution::TaskContext;
use datafusion::logical_expr::{Expr, TableProviderFilterPushDown, TableType};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
    SendableRecordBatchStream,
};
use span_store::{BatchReadClient, PartitionDescriptor, TableRef};
use tracing::debug;

use crate::config::ConnectOptions;
use crate::convert::rows_to_batch;
use crate::error::{df_external, ScanError};
use crate::reader::PartitionReaderFactory;
use crate::scanner::{ScanOptions, Scanner};
use crate::schema::{arrow_schema, derive_schema, ColumnSchema};

/// Rows accumulated per emitted record batch.
const BATCH_ROWS: usize = 1024;

/// Read-only table provider backed by partitioned snapshot scans.
pub struct SpanTableProvider {
    client: Arc<dyn BatchReadClient>,
    options: ConnectOptions,
    table: TableRef,
    schema: SchemaRef,
}

impl std::fmt::Debug for SpanTableProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanTableProvider")
            .field("options", &self.options)
            .field("table", &self.table)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SpanTableProvider {
    /// Resolves the table schema once and builds the provider.
    pub async fn try_new(
        client: Arc<dyn BatchReadClient>,
        options: ConnectOptions,
    ) -> Result<Self, ScanError> {
        let table = options.table_ref();
        let records = client.table_schema(&table).await?;
        let columns = derive_schema(table.dialect, &records)?;
        let schema = arrow_schema(&columns);
        Ok(Self {
            client,
            options,
            table,
            schema,
        })
    }
}

#[async_trait]
impl TableProvider for SpanTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    /// Nothing is pushed into the source; pruning happens engine-side.
    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        Ok(vec![TableProviderFilterPushDown::Unsupported; filters.len()])
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let scanner = Scanner::new(Arc::clone(&self.client), self.table.clone());
        let scan_options = ScanOptions {
            data_boost: self.options.data_boost,
        };
        let plan = scanner.plan(&scan_options).await.map_err(df_external)?;
        if plan.schema != self.schema {
            return Err(df_external(ScanError::Schema(format!(
                "schema of table {:?} changed since registration",
                self.table.table
            ))));
        }
        let exec = PartitionScanExec::try_new(
            Arc::clone(&self.client),
            self.table.clone(),
            plan.columns,
            plan.partitions,
            projection.cloned(),
        )?;
        Ok(Arc::new(exec))
    }
}

/// Leaf physical operator: one output partition per planned descriptor.
pub struct PartitionScanExec {
    client: Arc<dyn BatchReadClient>,
    table: TableRef,
    columns: Vec<ColumnSchema>,
    partitions: Vec<PartitionDescriptor>,
    projection: Option<Vec<usize>>,
    projected_schema: SchemaRef,
    properties: PlanProperties,
}

impl PartitionScanExec {
    pub fn try_new(
        client: Arc<dyn BatchReadClient>,
        table: TableRef,
        columns: Vec<ColumnSchema>,
        partitions: Vec<PartitionDescriptor>,
        projection: Option<Vec<usize>>,
    ) -> DFResult<Self> {
        let full_schema = arrow_schema(&columns);
        let projected_schema = match &projection {
            Some(indices) => Arc::new(full_schema.project(indices)?),
            None => full_schema,
        };
        // An empty plan still needs one output partition to emit its
        // (empty) stream through.
        let output_partitions = partitions.len().max(1);
        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&projected_schema)),
            Partitioning::UnknownPartitioning(output_partitions),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );
        Ok(Self {
            client,
            table,
            columns,
            partitions,
            projection,
            projected_schema,
            properties,
        })
    }

    pub fn partition_descriptors(&self) -> &[PartitionDescriptor] {
        &self.partitions
    }

    fn empty_stream(&self) -> SendableRecordBatchStream {
        let stream = futures::stream::empty::<DFResult<RecordBatch>>();
        Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.projected_schema),
            stream,
        ))
    }
}

impl fmt::Debug for PartitionScanExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionScanExec")
            .field("table", &self.table.table)
            .field("partitions", &self.partitions.len())
            .field("projection", &self.projection)
            .finish_non_exhaustive()
    }
}

impl DisplayAs for PartitionScanExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                write!(
                    f,
                    "PartitionScanExec: table={}, partitions={}",
                    self.table.table,
                    self.partitions.len()
                )?;
                if let Some(projection) = &self.projection {
                    write!(f, ", projection={projection:?}")?;
                }
                Ok(())
            }
            DisplayFormatType::TreeRender => {
                writeln!(f, "table={}", self.table.table)?;
                write!(f, "partitions={}", self.partitions.len())
            }
        }
    }
}

impl ExecutionPlan for PartitionScanExec {
    fn name(&self) -> &str {
        "PartitionScanExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        if children.is_empty() {
            Ok(self)
        } else {
            Err(DataFusionError::Internal(
                "PartitionScanExec cannot have children".to_string(),
            ))
        }
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        if self.partitions.is_empty() {
            if partition == 0 {
                return Ok(self.empty_stream());
            }
            return Err(DataFusionError::Internal(format!(
                "invalid partition index {partition} for empty scan"
            )));
        }
        let Some(descriptor) = self.partitions.get(partition) else {
            return Err(DataFusionError::Internal(format!(
                "invalid partition index {partition}, scan has {} partitions",
                self.partitions.len()
            )));
        };
        debug!(
            table = %self.table.table,
            partition = descriptor.index,
            snapshot = %descriptor.snapshot,
            "executing scan partition"
        );

        let factory = PartitionReaderFactory::new(Arc::clone(&self.client), self.columns.clone());
        let reader = factory.create_reader(descriptor.clone());
        let schema = Arc::clone(&self.projected_schema);
        let projection = self.projection.clone();

        let stream = futures::stream::try_unfold(reader, move |mut reader| {
            let schema = Arc::clone(&schema);
            let projection = projection.clone();
            async move {
                let mut rows: Vec<Vec<ScalarValue>> = Vec::new();
                while rows.len() < BATCH_ROWS {
                    match reader.next_row().await.map_err(df_external)? {
                        Some(row) => rows.push(project_row(row, projection.as_deref())),
                        None => break,
                    }
                }
                if rows.is_empty() {
                    return Ok(None);
                }
                let batch = rows_to_batch(schema, &rows).map_err(df_external)?;
                Ok(Some((batch, reader)))
            }
        });
        Ok(Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.projected_schema),
            stream,
        )))
    }
}

/// Keeps only the projected columns of a converted row, in projection order.
fn project_row(row: Vec<ScalarValue>, projection: Option<&[usize]>) -> Vec<ScalarValue> {
    match projection {
        Some(indices) => indices.iter().map(|i| row[*i].clone()).collect(),
        None => row,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use span_store::{Dialect, PartitionToken, SnapshotId};

    fn test_table() -> TableRef {
        TableRef {
            project: "p".into(),
            instance: "i".into(),
            database: "d".into(),
            table: "orders".into(),
            dialect: Dialect::GoogleSql,
        }
    }

    fn test_columns() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema {
                name: "id".into(),
                column_type: ColumnType::Int64,
                nullable: false,
            },
            ColumnSchema {
                name: "note".into(),
                column_type: ColumnType::String,
                nullable: true,
            },
        ]
    }

    fn test_partitions(count: usize) -> Vec<PartitionDescriptor> {
        (0..count)
            .map(|index| PartitionDescriptor {
                token: PartitionToken::new(vec![index as u8]),
                snapshot: SnapshotId::new("snap-1"),
                index,
            })
            .collect()
    }

    #[test]
    fn output_partitioning_matches_the_plan() {
        let client = Arc::new(span_store::emulator::EmulatorClient::new());
        let exec =
            PartitionScanExec::try_new(client, test_table(), test_columns(), test_partitions(3), None)
                .unwrap();
        assert_eq!(exec.properties().partitioning.partition_count(), 3);
        assert_eq!(exec.schema().fields().len(), 2);
    }

    #[test]
    fn projection_narrows_the_output_schema() {
        let client = Arc::new(span_store::emulator::EmulatorClient::new());
        let exec = PartitionScanExec::try_new(
            client,
            test_table(),
            test_columns(),
            test_partitions(2),
            Some(vec![1]),
        )
        .unwrap();
        assert_eq!(exec.schema().fields().len(), 1);
        assert_eq!(exec.schema().field(0).name(), "note");

        let row = vec![
            ScalarValue::Int64(Some(7)),
            ScalarValue::Utf8(Some("x".into())),
        ];
        assert_eq!(
            project_row(row, Some(&[1])),
            vec![ScalarValue::Utf8(Some("x".into()))]
        );
    }

    #[test]
    fn empty_plans_still_expose_one_output_partition() {
        let client = Arc::new(span_store::emulator::EmulatorClient::new());
        let exec =
            PartitionScanExec::try_new(client, test_table(), test_columns(), vec![], None).unwrap();
        assert_eq!(exec.properties().partitioning.partition_count(), 1);
    }
}
