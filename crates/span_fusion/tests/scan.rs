//! End-to-end scan-path tests against the in-process emulator: planning,
//! snapshot lifecycle, partition coverage, and failure scoping.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::common::ScalarValue;
use span_fusion::reader::PartitionReaderFactory;
use span_fusion::scanner::{ScanOptions, Scanner};
use span_fusion::ScanError;
use span_store::emulator::EmulatorClient;
use span_store::{
    ColumnRecord, Dialect, PartitionDescriptor, RawRow, RawValue, TableRef,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn planning_releases_the_snapshot_handle() -> Result<()> {
    let fixture = ScanFixture::with_rows(8);
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;

    assert!(!plan.partitions.is_empty());
    assert_eq!(
        fixture.client.live_snapshot_handles(),
        0,
        "planning must not leak a live snapshot handle"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_partitioning_still_releases_the_handle() -> Result<()> {
    let fixture = ScanFixture::with_rows(8);
    fixture.client.fail_partitioning(true);

    let err = fixture
        .scanner()
        .plan(&ScanOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Partition(_)), "{err}");
    assert_eq!(fixture.client.live_snapshot_handles(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_database_fails_planning_with_connection_error() -> Result<()> {
    let fixture = ScanFixture::with_rows(2);
    fixture.client.fail_connections(true);

    let err = fixture
        .scanner()
        .plan(&ScanOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Connection(_)), "{err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitions_union_to_the_exact_result_set() -> Result<()> {
    let fixture = ScanFixture::with_rows(25);
    fixture.client.set_max_partitions(4);
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;
    assert!(plan.partitions.len() > 1, "expected a multi-partition plan");

    let mut seen = BTreeSet::new();
    for descriptor in &plan.partitions {
        for id in fixture.read_ids(&plan, descriptor).await? {
            assert!(seen.insert(id), "row {id} appeared in two partitions");
        }
    }
    let expected: BTreeSet<i64> = (0..25).collect();
    assert_eq!(seen, expected, "union of partitions must be the full table");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_the_snapshot_not_later_writes() -> Result<()> {
    let fixture = ScanFixture::with_rows(6);
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;

    // Writes after planning must be invisible to every partition.
    fixture.client.insert_rows(
        ScanFixture::TABLE,
        vec![RawRow::new(vec![
            RawValue::Int64(999),
            RawValue::Numeric("1.0".into()),
        ])],
    );

    let mut seen = BTreeSet::new();
    for descriptor in &plan.partitions {
        seen.extend(fixture.read_ids(&plan, descriptor).await?);
    }
    assert!(!seen.contains(&999), "snapshot leaked a post-plan write");
    assert_eq!(seen.len(), 6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn descriptors_survive_serialization_across_workers() -> Result<()> {
    let fixture = ScanFixture::with_rows(10);
    fixture.client.set_max_partitions(2);
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;

    // Ship every descriptor through a serialized form, as a distributed
    // engine would when assigning partitions to workers.
    let mut seen = BTreeSet::new();
    for descriptor in &plan.partitions {
        let wire = serde_json::to_vec(descriptor).context("serialize descriptor")?;
        let restored: PartitionDescriptor =
            serde_json::from_slice(&wire).context("deserialize descriptor")?;
        assert_eq!(&restored, descriptor);
        seen.extend(fixture.read_ids(&plan, &restored).await?);
    }
    assert_eq!(seen.len(), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_boost_is_forwarded_to_partitioning() -> Result<()> {
    let fixture = ScanFixture::with_rows(3);
    fixture
        .scanner()
        .plan(&ScanOptions { data_boost: true })
        .await?;
    assert_eq!(fixture.client.last_data_boost(), Some(true));

    fixture.scanner().plan(&ScanOptions::default()).await?;
    assert_eq!(fixture.client.last_data_boost(), Some(false));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conversion_failure_is_scoped_to_its_partition() -> Result<()> {
    let fixture = ScanFixture::new();
    fixture.client.set_max_partitions(2);
    // Declared scale is 4; the last row carries five significant fractional
    // digits and lands in the second partition.
    fixture.client.insert_rows(
        ScanFixture::TABLE,
        vec![
            RawRow::new(vec![RawValue::Int64(0), RawValue::Numeric("1.5".into())]),
            RawRow::new(vec![RawValue::Int64(1), RawValue::Numeric("2.25".into())]),
            RawRow::new(vec![RawValue::Int64(2), RawValue::Numeric("3.0".into())]),
            RawRow::new(vec![
                RawValue::Int64(3),
                RawValue::Numeric("12.34567".into()),
            ]),
        ],
    );
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;
    assert_eq!(plan.partitions.len(), 2);

    let healthy = fixture.read_ids(&plan, &plan.partitions[0]).await?;
    assert_eq!(healthy, vec![0, 1]);

    let factory = fixture.factory(&plan);
    let mut reader = factory.create_reader(plan.partitions[1].clone());
    // The partition's valid prefix is still served before the bad row.
    assert!(reader.next_row().await?.is_some());
    let err = reader.next_row().await.unwrap_err();
    assert!(matches!(err, ScanError::Conversion(_)), "{err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_one_reader_leaves_siblings_untouched() -> Result<()> {
    let fixture = ScanFixture::with_rows(12);
    fixture.client.set_max_partitions(2);
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;
    assert_eq!(plan.partitions.len(), 2);

    let factory = fixture.factory(&plan);
    let mut early = factory.create_reader(plan.partitions[0].clone());
    let mut survivor = factory.create_reader(plan.partitions[1].clone());

    assert!(early.next_row().await?.is_some());
    assert!(survivor.next_row().await?.is_some());
    assert_eq!(fixture.client.open_row_streams(), 2);

    early.close();
    assert_eq!(fixture.client.open_row_streams(), 1);

    // The sibling keeps draining to completion.
    let mut rows = 1;
    while survivor.next_row().await?.is_some() {
        rows += 1;
    }
    assert_eq!(rows, 6);
    assert_eq!(fixture.client.open_row_streams(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_snapshot_fails_each_partition_with_transaction_error() -> Result<()> {
    let fixture = ScanFixture::with_rows(9);
    fixture.client.set_max_partitions(3);
    let plan = fixture.scanner().plan(&ScanOptions::default()).await?;
    fixture.client.expire_snapshot(&plan.partitions[0].snapshot);

    let factory = fixture.factory(&plan);
    for descriptor in &plan.partitions {
        let mut reader = factory.create_reader(descriptor.clone());
        let err = reader.next_row().await.unwrap_err();
        assert!(matches!(err, ScanError::Transaction(_)), "{err}");
    }
    Ok(())
}

/// Emulator-backed fixture around one two-column table.
struct ScanFixture {
    client: Arc<EmulatorClient>,
}

impl ScanFixture {
    const TABLE: &'static str = "ledger";

    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let client = Arc::new(EmulatorClient::new());
        client.create_table(
            Self::TABLE,
            vec![
                ColumnRecord {
                    name: "id".into(),
                    type_name: "INT64".into(),
                    nullable: false,
                },
                ColumnRecord {
                    name: "amount".into(),
                    type_name: "NUMERIC(10, 4)".into(),
                    nullable: true,
                },
            ],
        );
        Self { client }
    }

    fn with_rows(count: i64) -> Self {
        let fixture = Self::new();
        fixture.client.insert_rows(
            Self::TABLE,
            (0..count)
                .map(|id| {
                    RawRow::new(vec![
                        RawValue::Int64(id),
                        RawValue::Numeric(format!("{id}.25")),
                    ])
                })
                .collect(),
        );
        fixture
    }

    fn table_ref(&self) -> TableRef {
        TableRef {
            project: "test-project".into(),
            instance: "test-instance".into(),
            database: "test-db".into(),
            table: Self::TABLE.into(),
            dialect: Dialect::GoogleSql,
        }
    }

    fn scanner(&self) -> Scanner {
        Scanner::new(self.client.clone(), self.table_ref())
    }

    fn factory(&self, plan: &span_fusion::ScanPlan) -> PartitionReaderFactory {
        PartitionReaderFactory::new(self.client.clone(), plan.columns.clone())
    }

    /// Drains one partition and returns its `id` column values.
    async fn read_ids(
        &self,
        plan: &span_fusion::ScanPlan,
        descriptor: &PartitionDescriptor,
    ) -> Result<Vec<i64>> {
        let factory = self.factory(plan);
        let mut reader = factory.create_reader(descriptor.clone());
        let mut ids = Vec::new();
        while let Some(row) = reader.next_row().await? {
            let ScalarValue::Int64(Some(id)) = row[0] else {
                anyhow::bail!("expected int64 id column, got {:?}", row[0]);
            };
            ids.push(id);
        }
        Ok(ids)
    }
}
