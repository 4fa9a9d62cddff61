//! Buckets: durable keyed collections of LXP records.
//!
//! Every backend implements the [`Bucket`] trait:
//!
//! - [`DirectoryBucket`] - one JSON file per record, named by OID
//! - [`IndexedBucket`] - one append-only framed data file with an in-memory
//!   OID index rebuilt on open
//!
//! Each bucket directory carries a `bucket.json` naming its [`BucketKind`],
//! so repositories can reopen buckets without being told their kind.

mod directory;
mod frame;
mod indexed;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use lxp_types::{Lxp, Oid, RecordError};
use serde::{Deserialize, Serialize};

use crate::alloc::OidAllocator;
use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::fsutil::write_atomic;
use crate::locks::OidLocks;
use crate::types::TypeFactory;

pub use directory::DirectoryBucket;
pub use indexed::IndexedBucket;

/// Name of the descriptor file inside every bucket directory.
pub const BUCKET_META_FILE: &str = "bucket.json";

/// Shared handle to a bucket of any kind.
pub type BucketHandle = Arc<dyn Bucket>;

/// Backing kind of a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketKind {
    /// One file per record.
    Directory,
    /// Single data file plus an OID→offset index.
    Indexed,
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::Indexed => write!(f, "indexed"),
        }
    }
}

impl FromStr for BucketKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory" | "dir" => Ok(Self::Directory),
            "indexed" | "index" => Ok(Self::Indexed),
            other => Err(StoreError::Config(format!("unknown bucket kind: {other}"))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketMeta {
    kind: BucketKind,
}

/// Store-wide services every bucket needs.
#[derive(Clone)]
pub struct BucketContext {
    pub(crate) oids: Arc<OidAllocator>,
    pub(crate) types: Arc<TypeFactory>,
    pub(crate) locks: Arc<OidLocks>,
    pub(crate) sync: SyncMode,
}

impl BucketContext {
    pub fn oids(&self) -> &OidAllocator {
        &self.oids
    }

    pub fn types(&self) -> &TypeFactory {
        &self.types
    }

    pub fn locks(&self) -> &OidLocks {
        &self.locks
    }

    pub fn sync(&self) -> SyncMode {
        self.sync
    }
}

/// Durable keyed storage of LXP records.
///
/// Invariants every implementation upholds:
/// - OIDs are unique within a bucket and each record is retrievable by the
///   OID under which it was stored.
/// - Every durable write bumps the record's version stamp, except
///   [`restore_record`](Self::restore_record), which puts an earlier one
///   back.
/// - A failed write leaves no partial record visible.
/// - Once [`destroy`](Self::destroy) ran, every operation fails with
///   [`StoreError::BucketNotFound`], even through handles obtained earlier.
///
/// `write_record` and `remove_record` are the raw mutations. Callers must
/// hold the [`OidLocks`] entry for `(id(), oid)`; [`make_persistent`] and
/// [`delete`] do that for direct use, the transaction manager does it for
/// commits.
///
/// [`make_persistent`]: Self::make_persistent
/// [`delete`]: Self::delete
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the owning repository.
    fn repository(&self) -> &str;

    /// `repository/name`. Key for OID locks and log entries.
    fn id(&self) -> &str;

    fn kind(&self) -> BucketKind;

    /// Directory holding this bucket's durable state.
    fn path(&self) -> &Path;

    fn context(&self) -> &BucketContext;

    fn is_deleted(&self) -> bool;

    fn contains(&self, oid: Oid) -> StoreResult<bool>;

    /// Read a record. Fails with [`StoreError::ObjectNotFound`] if absent.
    fn get_object_by_id(&self, oid: Oid) -> StoreResult<Lxp>;

    /// Current version stamp, `None` if the record does not exist.
    fn version(&self, oid: Oid) -> StoreResult<Option<u64>>;

    /// Live OIDs in bucket order.
    fn oids(&self) -> StoreResult<Vec<Oid>>;

    /// Durably write `record` (which must carry an OID) and return its new
    /// version stamp.
    fn write_record(&self, record: &Lxp) -> StoreResult<u64>;

    /// Durably write `record` back under an earlier `version` stamp.
    ///
    /// Undoes a write of a failed commit so the record is indistinguishable
    /// from its state before the commit started.
    fn restore_record(&self, record: &Lxp, version: u64) -> StoreResult<()>;

    /// Durably remove a record.
    fn remove_record(&self, oid: Oid) -> StoreResult<()>;

    /// Remove all durable state and mark the bucket deleted.
    fn destroy(&self) -> StoreResult<()>;

    /// Reclaim space held by superseded data. Returns the bytes reclaimed.
    fn compact(&self) -> StoreResult<u64> {
        self.check_live()?;
        Ok(0)
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.oids()?.len())
    }

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    fn check_live(&self) -> StoreResult<()> {
        if self.is_deleted() {
            return Err(StoreError::bucket_not_found(self.repository(), self.name()));
        }
        Ok(())
    }

    /// Validate, assign an OID if unset, and durably write `record`.
    fn make_persistent(&self, record: &mut Lxp) -> StoreResult<Oid> {
        self.check_live()?;
        let ctx = self.context();
        ctx.types.validate(record)?;
        let oid = match record.oid() {
            Some(oid) => {
                ctx.oids.reserve_through(oid)?;
                oid
            }
            None => {
                let oid = ctx.oids.allocate()?;
                record.set_oid(oid);
                oid
            }
        };
        let _guard = ctx.locks.lock(self.id(), oid);
        self.write_record(record)?;
        Ok(oid)
    }

    /// Durably remove a record. Fails with [`StoreError::ObjectNotFound`]
    /// if absent.
    fn delete(&self, oid: Oid) -> StoreResult<()> {
        self.check_live()?;
        let _guard = self.context().locks.lock(self.id(), oid);
        self.remove_record(oid)
    }
}

impl fmt::Debug for dyn Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// Version stamps of live records plus the last stamp of deleted ones.
///
/// Remembering deleted stamps means a record re-persisted under the same
/// OID continues counting instead of restarting at 1, so a transaction that
/// observed the old record cannot mistake the new one for it.
#[derive(Default)]
pub(crate) struct VersionTable {
    live: RwLock<HashMap<Oid, u64>>,
    dead: Mutex<HashMap<Oid, u64>>,
}

impl VersionTable {
    pub(crate) fn get(&self, oid: Oid) -> Option<u64> {
        self.live.read().expect("version table poisoned").get(&oid).copied()
    }

    pub(crate) fn contains(&self, oid: Oid) -> bool {
        self.live.read().expect("version table poisoned").contains_key(&oid)
    }

    /// Stamp the next write of `oid` will carry.
    pub(crate) fn next(&self, oid: Oid) -> u64 {
        if let Some(v) = self.get(oid) {
            return v + 1;
        }
        self.dead
            .lock()
            .expect("version table poisoned")
            .get(&oid)
            .map_or(1, |v| v + 1)
    }

    pub(crate) fn set(&self, oid: Oid, version: u64) {
        self.dead.lock().expect("version table poisoned").remove(&oid);
        self.live
            .write()
            .expect("version table poisoned")
            .insert(oid, version);
    }

    pub(crate) fn kill(&self, oid: Oid, version: u64) {
        self.live.write().expect("version table poisoned").remove(&oid);
        self.dead
            .lock()
            .expect("version table poisoned")
            .insert(oid, version);
    }

    /// Last stamps of deleted OIDs, in OID order.
    pub(crate) fn dead_entries(&self) -> Vec<(Oid, u64)> {
        let mut dead: Vec<_> = self
            .dead
            .lock()
            .expect("version table poisoned")
            .iter()
            .map(|(oid, version)| (*oid, *version))
            .collect();
        dead.sort_unstable();
        dead
    }

    pub(crate) fn clear(&self) {
        self.live.write().expect("version table poisoned").clear();
        self.dead.lock().expect("version table poisoned").clear();
    }
}

/// OID a raw write stores `record` under. The null OID never reaches disk.
pub(crate) fn record_oid(record: &Lxp) -> StoreResult<Oid> {
    match record.oid() {
        Some(oid) if oid.is_null() => Err(RecordError::InvalidOid(oid.to_string()).into()),
        Some(oid) => Ok(oid),
        None => Err(StoreError::Serialization(
            "cannot write a record without an oid".into(),
        )),
    }
}

/// Identity of a bucket inside its store.
#[derive(Clone, Debug)]
pub(crate) struct BucketIdent {
    pub(crate) repository: String,
    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) path: PathBuf,
}

impl BucketIdent {
    pub(crate) fn new(repository: &str, name: &str, path: &Path) -> Self {
        Self {
            repository: repository.to_string(),
            name: name.to_string(),
            id: format!("{repository}/{name}"),
            path: path.to_path_buf(),
        }
    }
}

/// Create the directory and descriptor of a new bucket, then open it.
pub(crate) fn create_bucket(
    repository: &str,
    name: &str,
    path: &Path,
    kind: BucketKind,
    ctx: &BucketContext,
) -> StoreResult<BucketHandle> {
    fs::create_dir_all(path)?;
    let meta = serde_json::to_vec_pretty(&BucketMeta { kind })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    write_atomic(&path.join(BUCKET_META_FILE), &meta, ctx.sync)?;
    open_bucket(repository, name, path, ctx)
}

/// Open an existing bucket, dispatching on the kind in its descriptor.
pub(crate) fn open_bucket(
    repository: &str,
    name: &str,
    path: &Path,
    ctx: &BucketContext,
) -> StoreResult<BucketHandle> {
    let meta_path = path.join(BUCKET_META_FILE);
    let bytes = fs::read(&meta_path)?;
    let meta: BucketMeta = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::corrupt(&meta_path, e.to_string()))?;
    let ident = BucketIdent::new(repository, name, path);
    let bucket: BucketHandle = match meta.kind {
        BucketKind::Directory => Arc::new(DirectoryBucket::open(ident, ctx.clone())?),
        BucketKind::Indexed => Arc::new(IndexedBucket::open(ident, ctx.clone())?),
    };
    Ok(bucket)
}

/// Open the bucket at `path`, creating it with `kind` if it does not exist.
pub(crate) fn open_or_create_bucket(
    repository: &str,
    name: &str,
    path: &Path,
    kind: BucketKind,
    ctx: &BucketContext,
) -> StoreResult<BucketHandle> {
    if path.join(BUCKET_META_FILE).exists() {
        open_bucket(repository, name, path, ctx)
    } else {
        create_bucket(repository, name, path, kind, ctx)
    }
}
