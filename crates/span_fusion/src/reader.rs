//! Per-partition readers.
//!
//! A reader takes one [`PartitionDescriptor`], reopens the snapshot by
//! identity, executes the token, and converts rows until the partition is
//! drained. Readers are independent: no coordination with the planner or
//! with sibling readers, and a failure in one leaves the others untouched.

use std::sync::Arc;

use datafusion::common::ScalarValue;
use futures::StreamExt;
use span_store::{BatchReadClient, PartitionDescriptor, RawRowStream};
use tracing::{debug, warn};

use crate::convert::convert_row;
use crate::error::ScanError;
use crate::schema::ColumnSchema;

/// Builds readers for the partitions of one planned scan.
#[derive(Clone)]
pub struct PartitionReaderFactory {
    client: Arc<dyn BatchReadClient>,
    columns: Arc<Vec<ColumnSchema>>,
}

impl PartitionReaderFactory {
    pub fn new(client: Arc<dyn BatchReadClient>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            client,
            columns: Arc::new(columns),
        }
    }

    pub fn create_reader(&self, descriptor: PartitionDescriptor) -> PartitionReader {
        PartitionReader {
            client: Arc::clone(&self.client),
            columns: Arc::clone(&self.columns),
            descriptor,
            state: ReaderState::Unopened,
            rows_emitted: 0,
        }
    }
}

enum ReaderState {
    Unopened,
    Streaming(RawRowStream),
    Closed,
}

/// Cursor over one partition's rows, in converted engine form.
pub struct PartitionReader {
    client: Arc<dyn BatchReadClient>,
    columns: Arc<Vec<ColumnSchema>>,
    descriptor: PartitionDescriptor,
    state: ReaderState,
    rows_emitted: u64,
}

impl PartitionReader {
    pub fn descriptor(&self) -> &PartitionDescriptor {
        &self.descriptor
    }

    /// Returns the next converted row, or `None` once the partition is
    /// drained. The partition stream is opened lazily on the first call.
    ///
    /// Any error closes this reader and is scoped to this partition; rows
    /// already returned remain valid.
    pub async fn next_row(&mut self) -> Result<Option<Vec<ScalarValue>>, ScanError> {
        if matches!(self.state, ReaderState::Closed) {
            return Ok(None);
        }
        if matches!(self.state, ReaderState::Unopened) {
            let opened = self
                .client
                .execute_partition(&self.descriptor.snapshot, &self.descriptor.token)
                .await;
            match opened {
                Ok(stream) => self.state = ReaderState::Streaming(stream),
                Err(err) => {
                    let err = ScanError::from(err);
                    self.fail(&err.to_string());
                    return Err(err);
                }
            }
        }
        let ReaderState::Streaming(stream) = &mut self.state else {
            return Ok(None);
        };
        let item = stream.next().await;
        match item {
            Some(Ok(row)) => match convert_row(&self.columns, &row) {
                Ok(converted) => {
                    self.rows_emitted += 1;
                    Ok(Some(converted))
                }
                Err(err) => {
                    self.fail(&err.to_string());
                    Err(err.into())
                }
            },
            Some(Err(err)) => {
                self.fail(&err.to_string());
                Err(err.into())
            }
            None => {
                self.close();
                Ok(None)
            }
        }
    }

    fn fail(&mut self, error: &str) {
        warn!(
            partition = self.descriptor.index,
            snapshot = %self.descriptor.snapshot,
            error,
            "partition read failed"
        );
        self.close();
    }

    /// Releases the underlying stream. Idempotent; draining the partition or
    /// hitting an error closes the reader implicitly.
    pub fn close(&mut self) {
        if !matches!(self.state, ReaderState::Closed) {
            debug!(
                partition = self.descriptor.index,
                snapshot = %self.descriptor.snapshot,
                rows_emitted = self.rows_emitted,
                "closed partition reader"
            );
            self.state = ReaderState::Closed;
        }
    }
}

impl Drop for PartitionReader {
    fn drop(&mut self) {
        self.close();
    }
}
