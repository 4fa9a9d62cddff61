use lxp_types::{Lxp, LxpValue, Oid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::TransactionId;
use crate::bucket::{Bucket, BucketHandle};
use crate::error::{StoreError, StoreResult};

const TRANSACTION_LABEL: &str = "transaction";
const WRITES_LABEL: &str = "writes";

/// One buffered mutation as recorded in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogOp {
    Put { record: Lxp },
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogWrite {
    pub repository: String,
    pub bucket: String,
    pub oid: Oid,
    pub op: LogOp,
    /// Version stamp the commit found on the target, `None` if absent.
    #[serde(default)]
    pub base_version: Option<u64>,
}

/// Where a logged write stands against the bucket's current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteState {
    /// The target still carries the base stamp.
    Pending,
    /// The target already holds what the write would leave behind.
    Applied,
    /// The target moved on since the commit; the entry must not be applied.
    Stale,
}

fn classify(bucket: &dyn Bucket, write: &LogWrite) -> StoreResult<WriteState> {
    if bucket.version(write.oid)? == write.base_version {
        return Ok(WriteState::Pending);
    }
    let applied = match &write.op {
        LogOp::Put { record } => match bucket.get_object_by_id(write.oid) {
            Ok(current) => &current == record,
            Err(StoreError::ObjectNotFound { .. }) => false,
            Err(e) => return Err(e),
        },
        LogOp::Delete => !bucket.contains(write.oid)?,
    };
    Ok(if applied {
        WriteState::Applied
    } else {
        WriteState::Stale
    })
}

/// The durable form of a committing transaction's buffer.
///
/// Stored in the log bucket as a record with two text labels:
/// `transaction` (the id) and `writes` (a JSON array of [`LogWrite`]).
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub transaction: TransactionId,
    pub writes: Vec<LogWrite>,
}

impl LogEntry {
    pub fn to_record(&self) -> StoreResult<Lxp> {
        let writes = serde_json::to_string(&self.writes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Lxp::new()
            .with(TRANSACTION_LABEL, self.transaction.to_string())
            .with(WRITES_LABEL, writes))
    }

    pub fn from_record(record: &Lxp) -> StoreResult<Self> {
        let transaction = text_label(record, TRANSACTION_LABEL)?
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let writes = serde_json::from_str(text_label(record, WRITES_LABEL)?)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            transaction,
            writes,
        })
    }
}

fn text_label<'a>(record: &'a Lxp, label: &str) -> StoreResult<&'a str> {
    match record.get(label)? {
        LxpValue::Text(s) => Ok(s.as_str()),
        other => Err(StoreError::Serialization(format!(
            "log label {label} holds {}, expected text",
            other.kind()
        ))),
    }
}

/// Apply and remove every entry left in `log`, oldest first.
///
/// `resolve` maps `(repository, bucket)` to a live bucket, or `None` if the
/// bucket no longer exists; writes to missing buckets are dropped. An entry
/// is applied only while every target still carries its base stamp or
/// already holds the logged result. An entry whose targets were written
/// since is stale and is dropped whole. Runs before the store is shared, so
/// no OID locks are taken.
pub(crate) fn replay<F>(log: &dyn Bucket, resolve: F) -> StoreResult<usize>
where
    F: Fn(&str, &str) -> StoreResult<Option<BucketHandle>>,
{
    let recovery = |oid: Oid, e: StoreError| StoreError::Recovery(format!("log entry {oid}: {e}"));
    let mut replayed = 0;

    for oid in log.oids()? {
        let record = log.get_object_by_id(oid).map_err(|e| recovery(oid, e))?;
        let entry = LogEntry::from_record(&record).map_err(|e| recovery(oid, e))?;

        let mut pending = Vec::with_capacity(entry.writes.len());
        let mut stale = false;
        for write in &entry.writes {
            let Some(bucket) =
                resolve(&write.repository, &write.bucket).map_err(|e| recovery(oid, e))?
            else {
                warn!(
                    transaction = %entry.transaction,
                    repository = %write.repository,
                    bucket = %write.bucket,
                    "bucket of logged write is gone; skipping"
                );
                continue;
            };
            match classify(bucket.as_ref(), write).map_err(|e| recovery(oid, e))? {
                WriteState::Pending => pending.push((bucket, write)),
                WriteState::Applied => {}
                WriteState::Stale => {
                    warn!(
                        transaction = %entry.transaction,
                        bucket = %bucket.id(),
                        oid = %write.oid,
                        base_version = ?write.base_version,
                        "record changed after the logged commit; dropping entry"
                    );
                    stale = true;
                    break;
                }
            }
        }

        if !stale {
            for (bucket, write) in &pending {
                apply(bucket.as_ref(), write).map_err(|e| recovery(oid, e))?;
            }
        }

        log.remove_record(oid).map_err(|e| recovery(oid, e))?;
        info!(
            transaction = %entry.transaction,
            writes = entry.writes.len(),
            applied = if stale { 0 } else { pending.len() },
            "log entry replayed"
        );
        replayed += 1;
    }
    Ok(replayed)
}

/// Apply one logged write. Deleting an absent record is a no-op so replay
/// stays idempotent.
pub(crate) fn apply(bucket: &dyn Bucket, write: &LogWrite) -> StoreResult<()> {
    match &write.op {
        LogOp::Put { record } => {
            bucket.context().oids().reserve_through(write.oid)?;
            bucket.write_record(record)?;
        }
        LogOp::Delete => {
            if bucket.contains(write.oid)? {
                bucket.remove_record(write.oid)?;
            }
        }
    }
    Ok(())
}
