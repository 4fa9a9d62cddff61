use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use lxp_types::{Lxp, Oid};
use tracing::{debug, info, warn};

use super::log::{apply, LogEntry, LogOp, LogWrite};
use super::manager::Shared;
use super::{TransactionId, TransactionState};
use crate::bucket::{Bucket, BucketHandle};
use crate::error::{StoreError, StoreResult};

type Key = (String, Oid);

/// A record the transaction has read or written, with the version stamp
/// observed when it was first touched (`None` if it did not exist).
struct Touched {
    bucket: BucketHandle,
    snapshot: Option<u64>,
}

enum BufferedOp {
    Put(Lxp),
    Delete,
}

struct BufferedWrite {
    bucket: BucketHandle,
    oid: Oid,
    op: BufferedOp,
}

impl BufferedWrite {
    fn key(&self) -> Key {
        (self.bucket.id().to_string(), self.oid)
    }

    fn to_log(&self, base_version: Option<u64>) -> LogWrite {
        LogWrite {
            repository: self.bucket.repository().to_string(),
            bucket: self.bucket.name().to_string(),
            oid: self.oid,
            op: match &self.op {
                BufferedOp::Put(record) => LogOp::Put {
                    record: record.clone(),
                },
                BufferedOp::Delete => LogOp::Delete,
            },
            base_version,
        }
    }
}

/// The last buffered operation on each record, in first-touch order.
fn collapse(writes: &[BufferedWrite]) -> Vec<&BufferedWrite> {
    let mut last: Vec<&BufferedWrite> = Vec::new();
    for w in writes {
        match last
            .iter_mut()
            .find(|l| l.oid == w.oid && l.bucket.id() == w.bucket.id())
        {
            Some(slot) => *slot = w,
            None => last.push(w),
        }
    }
    last
}

/// A record's state before the commit touched it: its bytes and stamp, or
/// `None` if it did not exist.
type BeforeImage<'a> = (&'a BucketHandle, Oid, Option<(Lxp, u64)>);

struct TxnInner {
    state: TransactionState,
    touched: HashMap<Key, Touched>,
    writes: Vec<BufferedWrite>,
}

/// An optimistic unit of work spanning any buckets of one store.
///
/// Writes and deletes are buffered privately; direct bucket reads do not
/// see them until [`commit`](Self::commit). Reads through the transaction
/// see its own buffered writes first.
pub struct Transaction {
    id: TransactionId,
    shared: Arc<Shared>,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            id: TransactionId::new(),
            shared,
            inner: Mutex::new(TxnInner {
                state: TransactionState::Active,
                touched: HashMap::new(),
                writes: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Number of buffered writes and deletes.
    pub fn pending_writes(&self) -> usize {
        self.lock().writes.len()
    }

    fn lock(&self) -> MutexGuard<'_, TxnInner> {
        self.inner.lock().expect("transaction poisoned")
    }

    fn active<'a>(&self, inner: MutexGuard<'a, TxnInner>) -> StoreResult<MutexGuard<'a, TxnInner>> {
        if inner.state != TransactionState::Active {
            return Err(StoreError::IllegalTransactionState {
                transaction: self.id,
                state: inner.state,
            });
        }
        Ok(inner)
    }

    /// Record the version of `(bucket, oid)` the first time it is touched.
    fn touch(inner: &mut TxnInner, bucket: &BucketHandle, oid: Oid) -> StoreResult<()> {
        let key = (bucket.id().to_string(), oid);
        if !inner.touched.contains_key(&key) {
            let snapshot = bucket.version(oid)?;
            inner.touched.insert(
                key,
                Touched {
                    bucket: Arc::clone(bucket),
                    snapshot,
                },
            );
        }
        Ok(())
    }

    /// Latest buffered operation on `(bucket, oid)`, if any.
    fn buffered<'a>(inner: &'a TxnInner, bucket: &dyn Bucket, oid: Oid) -> Option<&'a BufferedOp> {
        inner
            .writes
            .iter()
            .rev()
            .find(|w| w.oid == oid && w.bucket.id() == bucket.id())
            .map(|w| &w.op)
    }

    /// Read a record, preferring this transaction's buffered value.
    pub fn get_object_by_id(&self, bucket: &BucketHandle, oid: Oid) -> StoreResult<Lxp> {
        let mut inner = self.active(self.lock())?;
        Self::touch(&mut inner, bucket, oid)?;
        match Self::buffered(&inner, bucket.as_ref(), oid) {
            Some(BufferedOp::Put(record)) => Ok(record.clone()),
            Some(BufferedOp::Delete) => Err(StoreError::ObjectNotFound {
                bucket: bucket.id().to_string(),
                oid,
            }),
            None => bucket.get_object_by_id(oid),
        }
    }

    pub fn contains(&self, bucket: &BucketHandle, oid: Oid) -> StoreResult<bool> {
        let mut inner = self.active(self.lock())?;
        Self::touch(&mut inner, bucket, oid)?;
        match Self::buffered(&inner, bucket.as_ref(), oid) {
            Some(BufferedOp::Put(_)) => Ok(true),
            Some(BufferedOp::Delete) => Ok(false),
            None => bucket.contains(oid),
        }
    }

    /// Buffer a write of `record` into `bucket`.
    ///
    /// Typed records are validated now. An OID is assigned immediately if
    /// the record has none, so the caller can reference it before commit.
    pub fn make_persistent(&self, bucket: &BucketHandle, record: &mut Lxp) -> StoreResult<Oid> {
        let mut inner = self.active(self.lock())?;
        bucket.check_live()?;
        let ctx = bucket.context();
        ctx.types().validate(record)?;
        let oid = match record.oid() {
            Some(oid) => {
                ctx.oids().reserve_through(oid)?;
                oid
            }
            None => {
                let oid = ctx.oids().allocate()?;
                record.set_oid(oid);
                oid
            }
        };
        Self::touch(&mut inner, bucket, oid)?;
        inner.writes.push(BufferedWrite {
            bucket: Arc::clone(bucket),
            oid,
            op: BufferedOp::Put(record.clone()),
        });
        debug!(transaction = %self.id, bucket = %bucket.id(), %oid, "put buffered");
        Ok(oid)
    }

    /// Buffer a delete. Fails with [`StoreError::ObjectNotFound`] if the
    /// record is absent as seen by this transaction.
    pub fn delete(&self, bucket: &BucketHandle, oid: Oid) -> StoreResult<()> {
        let mut inner = self.active(self.lock())?;
        Self::touch(&mut inner, bucket, oid)?;
        let exists = match Self::buffered(&inner, bucket.as_ref(), oid) {
            Some(BufferedOp::Put(_)) => true,
            Some(BufferedOp::Delete) => false,
            None => bucket.contains(oid)?,
        };
        if !exists {
            return Err(StoreError::ObjectNotFound {
                bucket: bucket.id().to_string(),
                oid,
            });
        }
        inner.writes.push(BufferedWrite {
            bucket: Arc::clone(bucket),
            oid,
            op: BufferedOp::Delete,
        });
        debug!(transaction = %self.id, bucket = %bucket.id(), %oid, "delete buffered");
        Ok(())
    }

    /// Make the buffered writes durable, or fail leaving the transaction
    /// active.
    ///
    /// Fails with [`StoreError::ConflictDetected`] if any touched record
    /// changed since it was first touched, and with
    /// [`StoreError::StoreFailure`] if the writes could not be made durable.
    /// In both cases no buffered write is visible afterwards.
    pub fn commit(&self) -> StoreResult<()> {
        let mut inner = self.active(self.lock())?;
        let shared = &self.shared;
        let _commit = shared.commit_lock.lock().expect("commit lock poisoned");
        let locks = shared.log.context().locks();
        let _guards = locks.lock_all(inner.touched.keys().map(|(b, o)| (b.as_str(), *o)));

        for ((bucket, oid), touched) in &inner.touched {
            let current = touched.bucket.version(*oid)?;
            if current != touched.snapshot {
                debug!(
                    transaction = %self.id,
                    %bucket,
                    %oid,
                    snapshot = ?touched.snapshot,
                    ?current,
                    "conflict detected"
                );
                return Err(StoreError::ConflictDetected {
                    transaction: self.id,
                    bucket: bucket.clone(),
                    oid: *oid,
                });
            }
        }

        if !inner.writes.is_empty() {
            self.write_through(&inner)?;
        }

        let writes = inner.writes.len();
        inner.state = TransactionState::Committed;
        inner.writes.clear();
        inner.touched.clear();
        drop(inner);
        shared.forget(self.id);
        info!(transaction = %self.id, writes, "transaction committed");
        Ok(())
    }

    /// Log, apply, and unlog the buffered writes. Caller holds the OID
    /// locks and has checked every snapshot.
    ///
    /// If a write fails, the applied ones are undone with their stamps
    /// restored, so the transaction can commit again. If the log entry
    /// cannot be removed afterwards, the next open settles it by replay.
    fn write_through(&self, inner: &TxnInner) -> StoreResult<()> {
        let failure = |what: &str, e: StoreError| {
            StoreError::StoreFailure(format!("transaction {}: {what}: {e}", self.id))
        };

        let writes = collapse(&inner.writes);
        let mut before: Vec<BeforeImage<'_>> = Vec::with_capacity(writes.len());
        let mut logged = Vec::with_capacity(writes.len());
        for w in &writes {
            let base_version = inner.touched.get(&w.key()).and_then(|t| t.snapshot);
            let image = match w.bucket.get_object_by_id(w.oid) {
                Ok(record) => base_version.map(|version| (record, version)),
                Err(StoreError::ObjectNotFound { .. }) => None,
                Err(e) => return Err(failure("reading before-image", e)),
            };
            before.push((&w.bucket, w.oid, image));
            logged.push(w.to_log(base_version));
        }

        let entry = LogEntry {
            transaction: self.id,
            writes: logged,
        };
        let log = &self.shared.log;
        let mut record = entry.to_record()?;
        let log_oid = log
            .context()
            .oids()
            .allocate()
            .map_err(|e| failure("allocating log entry", e))?;
        record.set_oid(log_oid);
        log.write_record(&record)
            .map_err(|e| failure("appending log entry", e))?;

        for (applied, (w, write)) in writes.iter().zip(&entry.writes).enumerate() {
            if let Err(e) = apply(w.bucket.as_ref(), write) {
                warn!(transaction = %self.id, bucket = %w.bucket.id(), oid = %w.oid, error = %e, "apply failed; undoing");
                if let Err(undo_err) = undo(&before[..applied]) {
                    warn!(
                        transaction = %self.id,
                        error = %undo_err,
                        "undo failed; log entry kept for replay"
                    );
                    return Err(failure("applying writes", e));
                }
                if let Err(remove_err) = log.remove_record(log_oid) {
                    warn!(
                        transaction = %self.id,
                        %log_oid,
                        error = %remove_err,
                        "could not remove log entry after undo; it is replayed on next open"
                    );
                }
                return Err(failure("applying writes", e));
            }
        }

        if let Err(e) = log.remove_record(log_oid) {
            // Replay drops an entry whose targets have moved on, so a
            // leftover entry cannot roll back later commits.
            warn!(transaction = %self.id, %log_oid, error = %e, "could not remove applied log entry");
        }
        Ok(())
    }

    /// Discard the buffer. Fails with
    /// [`StoreError::IllegalTransactionState`] unless active.
    pub fn rollback(&self) -> StoreResult<()> {
        let mut inner = self.active(self.lock())?;
        let discarded = inner.writes.len();
        inner.state = TransactionState::RolledBack;
        inner.writes.clear();
        inner.touched.clear();
        drop(inner);
        self.shared.forget(self.id);
        info!(transaction = %self.id, discarded, "transaction rolled back");
        Ok(())
    }
}

/// Restore before-images, newest first, stamps included.
fn undo(before: &[BeforeImage<'_>]) -> StoreResult<()> {
    for (bucket, oid, image) in before.iter().rev() {
        match image {
            Some((record, version)) => bucket.restore_record(record, *version)?,
            None => {
                if bucket.contains(*oid)? {
                    bucket.remove_record(*oid)?;
                }
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("touched", &inner.touched.len())
            .field("writes", &inner.writes.len())
            .finish()
    }
}
