//! Append-only record sink
//!
//! Each record is stored as one self-describing JSON row at
//!
//! ```text
//! {prefix}/account_id={account}/region={region}/run_date={YYYY-MM-DD}/run_id={run}/{node}_{start}_{end}.json
//! ```
//!
//! Writing a record whose key already holds identical bytes is a no-op.
//! A key holding different bytes is reported as a conflict and left alone,
//! so history is never rewritten.

use super::ObjectStore;
use crate::error::{ReadError, WriteError};
use crate::models::UtilizationRecord;
use crate::observability::{CollectorMetrics, StructuredLogger};
use crate::retry::{drive, Disposition, RetryPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bumped whenever a persisted field changes meaning
pub const SCHEMA_VERSION: u32 = 1;

/// On-disk row: the record plus its schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub schema_version: u32,
    #[serde(flatten)]
    pub record: UtilizationRecord,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub prefix: String,
    /// Applied per record by [`RecordSink::write_with_retry`]
    pub retry: RetryPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            prefix: "cpu_utilization".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Duplicate,
    Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub written: usize,
    pub duplicates: usize,
    /// Keys that already held different content
    pub conflicts: Vec<String>,
}

impl WriteResult {
    fn add(&mut self, key: String, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written => self.written += 1,
            WriteOutcome::Duplicate => self.duplicates += 1,
            WriteOutcome::Conflict => self.conflicts.push(key),
        }
    }
}

pub struct RecordSink {
    store: Arc<dyn ObjectStore>,
    config: SinkConfig,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
}

impl RecordSink {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: SinkConfig,
        metrics: CollectorMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            logger,
        }
    }

    /// Object key for a record
    pub fn key_for(&self, record: &UtilizationRecord) -> String {
        format!(
            "{}/account_id={}/region={}/run_date={}/run_id={}/{}_{}_{}.json",
            self.config.prefix.trim_end_matches('/'),
            record.account_id,
            record.region,
            record.window_end.format("%Y-%m-%d"),
            sanitize(&record.run_id),
            sanitize(&record.node_id),
            record.window_start.format("%Y%m%dT%H%M%SZ"),
            record.window_end.format("%Y%m%dT%H%M%SZ"),
        )
    }

    /// Persist records in any order. Stops at the first store failure.
    pub async fn write(&self, records: &[UtilizationRecord]) -> Result<WriteResult, WriteError> {
        let mut result = WriteResult::default();
        let outcome = async {
            for record in records {
                let key = self.key_for(record);
                let outcome = self.write_one(&key, record).await?;
                result.add(key, outcome);
            }
            Ok(())
        }
        .await;
        self.report(&result);
        outcome.map(|()| result)
    }

    /// Like [`write`](Self::write), retrying each record while the store is
    /// unavailable. Records already written are never written twice.
    pub async fn write_with_retry(
        &self,
        records: &[UtilizationRecord],
    ) -> Result<WriteResult, WriteError> {
        let mut result = WriteResult::default();
        let outcome = async {
            for record in records {
                let key = self.key_for(record);
                let outcome = drive(
                    &self.config.retry,
                    |_| self.write_one(&key, record),
                    |err: &WriteError| match err {
                        WriteError::Unavailable { .. } => Disposition::Retry { hint: None },
                        WriteError::Encode { .. } => Disposition::Fatal,
                    },
                )
                .await
                .map_err(|exhausted| exhausted.error)?;
                result.add(key, outcome);
            }
            Ok(())
        }
        .await;
        self.report(&result);
        outcome.map(|()| result)
    }

    async fn write_one(
        &self,
        key: &str,
        record: &UtilizationRecord,
    ) -> Result<WriteOutcome, WriteError> {
        let row = StoredRow {
            schema_version: SCHEMA_VERSION,
            record: record.clone(),
        };
        let bytes = serde_json::to_vec(&row).map_err(|e| WriteError::Encode {
            node_id: record.node_id.clone(),
            reason: e.to_string(),
        })?;

        let unavailable = |reason: String| WriteError::Unavailable {
            key: key.to_string(),
            reason,
        };

        let existing = self
            .store
            .get_object(key)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let outcome = match existing {
            Some(stored) if checksum(&stored) == checksum(&bytes) => WriteOutcome::Duplicate,
            Some(_) => {
                warn!(key = %key, node_id = %record.node_id, "Key already holds a different record, not overwriting");
                WriteOutcome::Conflict
            }
            None => {
                self.store
                    .put_object(key, bytes)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
                WriteOutcome::Written
            }
        };

        if outcome != WriteOutcome::Conflict {
            self.logger.log_record_persisted(
                key,
                &record.node_id,
                outcome == WriteOutcome::Duplicate,
            );
        }
        Ok(outcome)
    }

    /// Every record stored under `prefix` (the configured prefix if `None`)
    pub async fn read_records(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<UtilizationRecord>, ReadError> {
        let prefix = prefix.unwrap_or(&self.config.prefix);
        let keys = self
            .store
            .list_keys(prefix)
            .await
            .map_err(|e| ReadError::Unavailable {
                reason: e.to_string(),
            })?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self
                .store
                .get_object(&key)
                .await
                .map_err(|e| ReadError::Unavailable {
                    reason: e.to_string(),
                })?
            else {
                continue;
            };
            let row: StoredRow = serde_json::from_slice(&bytes).map_err(|e| ReadError::Decode {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            records.push(row.record);
        }

        debug!(prefix = %prefix, records = records.len(), "Read persisted records");
        Ok(records)
    }

    fn report(&self, result: &WriteResult) {
        self.metrics
            .record_sink_write(result.written, result.duplicates, result.conflicts.len());
    }
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}
