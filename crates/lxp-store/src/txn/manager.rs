use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{Transaction, TransactionId};
use crate::bucket::BucketHandle;
use crate::error::StoreResult;

/// State shared between a manager and the transactions it started.
pub(crate) struct Shared {
    pub(crate) log: BucketHandle,
    /// Serializes commits against each other.
    pub(crate) commit_lock: Mutex<()>,
    live: Mutex<HashMap<TransactionId, Weak<Transaction>>>,
}

impl Shared {
    pub(crate) fn forget(&self, id: TransactionId) {
        self.live.lock().expect("transaction table poisoned").remove(&id);
    }
}

/// Starts transactions and tracks the live ones.
///
/// One manager exists per store. Transactions are held weakly, so a
/// transaction dropped without commit or rollback simply disappears; its
/// buffer never reaches durable state.
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<Shared>,
}

impl TransactionManager {
    /// Create a manager logging commits into `log`.
    pub(crate) fn new(log: BucketHandle) -> Self {
        Self {
            shared: Arc::new(Shared {
                log,
                commit_lock: Mutex::new(()),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn begin_transaction(&self) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(Arc::clone(&self.shared)));
        self.shared
            .live
            .lock()
            .expect("transaction table poisoned")
            .insert(txn.id(), Arc::downgrade(&txn));
        debug!(transaction = %txn.id(), "transaction started");
        txn
    }

    /// Look up a live transaction.
    pub fn get_transaction(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        let mut live = self.shared.live.lock().expect("transaction table poisoned");
        match live.get(&id).map(Weak::upgrade) {
            Some(Some(txn)) => Some(txn),
            Some(None) => {
                live.remove(&id);
                None
            }
            None => None,
        }
    }

    /// Stop tracking `txn`, rolling it back if it is still active.
    /// Does nothing for committed or rolled-back transactions.
    pub fn remove_transaction(&self, txn: &Transaction) -> StoreResult<()> {
        if txn.is_active() {
            // A concurrent commit or rollback may win the race; either way
            // the transaction is no longer active afterwards.
            let _ = txn.rollback();
        }
        self.shared.forget(txn.id());
        Ok(())
    }

    /// Ids of transactions that are started, not yet finished, and still
    /// referenced somewhere.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut live = self.shared.live.lock().expect("transaction table poisoned");
        live.retain(|_, weak| weak.strong_count() > 0);
        let mut ids: Vec<TransactionId> = live.keys().copied().collect();
        ids.sort();
        ids
    }

    /// The bucket holding log entries of in-flight commits.
    pub fn get_log(&self) -> &BucketHandle {
        &self.shared.log
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("log", &self.shared.log.id())
            .field("active", &self.active_transactions().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::test_support::context;
    use crate::bucket::{create_bucket, BucketKind};
    use crate::error::StoreError;
    use crate::txn::TransactionState;
    use lxp_types::{Lxp, LxpValue, Oid};

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: TransactionManager,
        bucket: BucketHandle,
    }

    fn fixture(kind: BucketKind) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let log =
            create_bucket("_store", "txlog", &dir.path().join("txlog"), BucketKind::Directory, &ctx)
                .unwrap();
        let bucket = create_bucket("repo", "b", &dir.path().join("b"), kind, &ctx).unwrap();
        Fixture {
            _dir: dir,
            manager: TransactionManager::new(log),
            bucket,
        }
    }

    #[test]
    fn begin_tracks_live_transactions() {
        let f = fixture(BucketKind::Directory);
        let t1 = f.manager.begin_transaction();
        let t2 = f.manager.begin_transaction();
        assert_ne!(t1.id(), t2.id());
        assert!(t1.is_active());
        assert_eq!(f.manager.active_transactions().len(), 2);
        assert!(f.manager.get_transaction(t1.id()).is_some());

        t1.rollback().unwrap();
        assert!(f.manager.get_transaction(t1.id()).is_none());
        assert_eq!(f.manager.active_transactions(), vec![t2.id()]);

        // dropped without finishing
        let id = t2.id();
        drop(t2);
        assert!(f.manager.get_transaction(id).is_none());
        assert!(f.manager.active_transactions().is_empty());
    }

    #[test]
    fn buffered_writes_are_private_until_commit() {
        let f = fixture(BucketKind::Directory);
        let txn = f.manager.begin_transaction();
        let mut record = Lxp::new().with("k", "v");
        let oid = txn.make_persistent(&f.bucket, &mut record).unwrap();

        assert!(!f.bucket.contains(oid).unwrap());
        assert_eq!(txn.get_object_by_id(&f.bucket, oid).unwrap(), record);
        assert!(txn.contains(&f.bucket, oid).unwrap());

        txn.commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(f.bucket.get_object_by_id(oid).unwrap(), record);
        assert!(f.manager.get_log().is_empty().unwrap());
    }

    #[test]
    fn delete_inside_transaction() {
        let f = fixture(BucketKind::Indexed);
        let oid = f.bucket.make_persistent(&mut Lxp::new().with("k", 1i64)).unwrap();

        let txn = f.manager.begin_transaction();
        txn.delete(&f.bucket, oid).unwrap();
        assert!(!txn.contains(&f.bucket, oid).unwrap());
        assert!(matches!(
            txn.get_object_by_id(&f.bucket, oid),
            Err(StoreError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            txn.delete(&f.bucket, oid),
            Err(StoreError::ObjectNotFound { .. })
        ));
        assert!(f.bucket.contains(oid).unwrap());

        txn.commit().unwrap();
        assert!(!f.bucket.contains(oid).unwrap());
    }

    #[test]
    fn later_buffered_write_wins() {
        let f = fixture(BucketKind::Directory);
        let txn = f.manager.begin_transaction();
        let mut record = Lxp::new().with("n", 1i64);
        let oid = txn.make_persistent(&f.bucket, &mut record).unwrap();
        record.put("n", 2i64);
        txn.make_persistent(&f.bucket, &mut record).unwrap();
        assert_eq!(txn.pending_writes(), 2);
        txn.commit().unwrap();
        assert_eq!(
            f.bucket.get_object_by_id(oid).unwrap().get("n").unwrap(),
            &LxpValue::Int(2)
        );
        assert_eq!(f.bucket.version(oid).unwrap(), Some(2));
    }

    #[test]
    fn conflicting_commit_fails_and_stays_active() {
        let f = fixture(BucketKind::Directory);
        let mut x = Lxp::new().with("v", 0i64);
        let oid = f.bucket.make_persistent(&mut x).unwrap();

        let t1 = f.manager.begin_transaction();
        let t2 = f.manager.begin_transaction();
        let mut seen1 = t1.get_object_by_id(&f.bucket, oid).unwrap();
        t2.get_object_by_id(&f.bucket, oid).unwrap();

        seen1.put("v", 1i64);
        t1.make_persistent(&f.bucket, &mut seen1).unwrap();
        t1.commit().unwrap();

        match t2.commit() {
            Err(StoreError::ConflictDetected { transaction, oid: o, .. }) => {
                assert_eq!(transaction, t2.id());
                assert_eq!(o, oid);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(t2.is_active());
        t2.rollback().unwrap();

        let t3 = f.manager.begin_transaction();
        let mut seen3 = t3.get_object_by_id(&f.bucket, oid).unwrap();
        assert_eq!(seen3.get("v").unwrap(), &LxpValue::Int(1));
        seen3.put("v", 3i64);
        t3.make_persistent(&f.bucket, &mut seen3).unwrap();
        t3.commit().unwrap();
        assert_eq!(
            f.bucket.get_object_by_id(oid).unwrap().get("v").unwrap(),
            &LxpValue::Int(3)
        );
    }

    #[test]
    fn direct_write_conflicts_with_transaction() {
        let f = fixture(BucketKind::Indexed);
        let mut x = Lxp::new().with("v", 0i64);
        let oid = f.bucket.make_persistent(&mut x).unwrap();

        let txn = f.manager.begin_transaction();
        txn.get_object_by_id(&f.bucket, oid).unwrap();
        x.put("v", 9i64);
        f.bucket.make_persistent(&mut x).unwrap();
        assert!(matches!(txn.commit(), Err(StoreError::ConflictDetected { .. })));
    }

    #[test]
    fn recreate_after_delete_is_a_conflict() {
        let f = fixture(BucketKind::Directory);
        let mut x = Lxp::new();
        let oid = f.bucket.make_persistent(&mut x).unwrap();

        let txn = f.manager.begin_transaction();
        txn.get_object_by_id(&f.bucket, oid).unwrap();
        f.bucket.delete(oid).unwrap();
        f.bucket.make_persistent(&mut x).unwrap();
        assert!(matches!(txn.commit(), Err(StoreError::ConflictDetected { .. })));
    }

    #[test]
    fn finished_transactions_reject_operations() {
        let f = fixture(BucketKind::Directory);
        let txn = f.manager.begin_transaction();
        txn.commit().unwrap();
        assert!(matches!(
            txn.rollback(),
            Err(StoreError::IllegalTransactionState {
                state: TransactionState::Committed,
                ..
            })
        ));
        assert!(matches!(
            txn.make_persistent(&f.bucket, &mut Lxp::new()),
            Err(StoreError::IllegalTransactionState { .. })
        ));

        let txn = f.manager.begin_transaction();
        txn.rollback().unwrap();
        assert!(matches!(txn.commit(), Err(StoreError::IllegalTransactionState { .. })));
    }

    #[test]
    fn remove_transaction_rolls_back_active_ones() {
        let f = fixture(BucketKind::Directory);
        let txn = f.manager.begin_transaction();
        let oid = txn.make_persistent(&f.bucket, &mut Lxp::new()).unwrap();
        f.manager.remove_transaction(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::RolledBack);
        assert!(f.manager.get_transaction(txn.id()).is_none());
        assert!(!f.bucket.contains(oid).unwrap());

        // no-op on finished transactions
        f.manager.remove_transaction(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::RolledBack);
    }

    #[test]
    fn commit_touching_destroyed_bucket_fails() {
        let f = fixture(BucketKind::Directory);
        let txn = f.manager.begin_transaction();
        let other = {
            let dir = f.bucket.path().parent().unwrap().join("other");
            create_bucket("repo", "other", &dir, BucketKind::Directory, f.bucket.context()).unwrap()
        };
        let kept = txn.make_persistent(&f.bucket, &mut Lxp::new().with("k", 1i64)).unwrap();
        txn.make_persistent(&other, &mut Lxp::new()).unwrap();
        // touched with a None snapshot, then destroyed behind the transaction's back
        other.destroy().unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound { .. }), "{err:?}");
        assert!(txn.is_active());
        assert!(!f.bucket.contains(kept).unwrap());
        assert!(f.manager.get_log().is_empty().unwrap());
    }

    #[test]
    fn reading_missing_record_pins_absence() {
        let f = fixture(BucketKind::Directory);
        let txn = f.manager.begin_transaction();
        assert!(matches!(
            txn.get_object_by_id(&f.bucket, Oid::new(404)),
            Err(StoreError::ObjectNotFound { .. })
        ));
        // reading a missing record still pins its absence
        f.bucket
            .make_persistent(&mut {
                let mut r = Lxp::new();
                r.set_oid(Oid::new(404));
                r
            })
            .unwrap();
        assert!(matches!(txn.commit(), Err(StoreError::ConflictDetected { .. })));
    }
}
