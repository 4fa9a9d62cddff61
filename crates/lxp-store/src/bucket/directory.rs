use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use lxp_types::{Lxp, Oid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{record_oid, Bucket, BucketContext, BucketIdent, BucketKind, VersionTable};
use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::fsutil::{remove_if_exists, sync_dir, write_atomic};

/// On-disk shape of one record file.
#[derive(Serialize, Deserialize)]
struct RecordFile {
    version: u64,
    record: Lxp,
}

/// Bucket storing one JSON file per record, named by OID.
///
/// Files are replaced by write-then-rename, so readers never observe a
/// partially written record. Iteration follows insertion order within a
/// process; records found on disk at open are ordered by OID.
pub struct DirectoryBucket {
    ident: BucketIdent,
    ctx: BucketContext,
    versions: VersionTable,
    order: RwLock<Vec<Oid>>,
    deleted: AtomicBool,
}

impl DirectoryBucket {
    pub(crate) fn open(ident: BucketIdent, ctx: BucketContext) -> StoreResult<Self> {
        let versions = VersionTable::default();
        let mut order = Vec::new();

        for entry in fs::read_dir(&ident.path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            // Skips bucket.json and leftover `.tmp*` files from interrupted writes.
            let Some(oid) = file_name.to_str().and_then(|s| s.parse::<Oid>().ok()) else {
                continue;
            };
            let file = read_record_file(&entry.path())?;
            check_oid(&entry.path(), &file, oid)?;
            versions.set(oid, file.version);
            order.push(oid);
        }
        order.sort_unstable();

        debug!(bucket = %ident.id, records = order.len(), "opened directory bucket");
        Ok(Self {
            ident,
            ctx,
            versions,
            order: RwLock::new(order),
            deleted: AtomicBool::new(false),
        })
    }

    fn write_at(&self, oid: Oid, record: &Lxp, version: u64) -> StoreResult<()> {
        let file = RecordFile {
            version,
            record: record.clone(),
        };
        let bytes =
            serde_json::to_vec(&file).map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.record_path(oid), &bytes, self.ctx.sync)
            .map_err(|e| self.write_failure(e))?;

        let is_new = !self.versions.contains(oid);
        self.versions.set(oid, version);
        if is_new {
            self.order.write().expect("bucket order poisoned").push(oid);
        }
        debug!(bucket = %self.ident.id, %oid, version, "record written");
        Ok(())
    }

    fn record_path(&self, oid: Oid) -> PathBuf {
        self.ident.path.join(oid.file_name())
    }

    fn write_failure(&self, source: io::Error) -> StoreError {
        StoreError::BucketWrite {
            bucket: self.ident.id.clone(),
            source,
        }
    }

    fn not_found(&self, oid: Oid) -> StoreError {
        StoreError::ObjectNotFound {
            bucket: self.ident.id.clone(),
            oid,
        }
    }
}

fn read_record_file(path: &Path) -> StoreResult<RecordFile> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(path, e.to_string()))
}

fn check_oid(path: &Path, file: &RecordFile, oid: Oid) -> StoreResult<()> {
    if file.record.oid() != Some(oid) {
        return Err(StoreError::corrupt(
            path,
            format!("file holds record {:?}", file.record.oid()),
        ));
    }
    Ok(())
}

impl Bucket for DirectoryBucket {
    fn name(&self) -> &str {
        &self.ident.name
    }

    fn repository(&self) -> &str {
        &self.ident.repository
    }

    fn id(&self) -> &str {
        &self.ident.id
    }

    fn kind(&self) -> BucketKind {
        BucketKind::Directory
    }

    fn path(&self) -> &Path {
        &self.ident.path
    }

    fn context(&self) -> &BucketContext {
        &self.ctx
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn contains(&self, oid: Oid) -> StoreResult<bool> {
        self.check_live()?;
        Ok(self.versions.contains(oid))
    }

    fn get_object_by_id(&self, oid: Oid) -> StoreResult<Lxp> {
        self.check_live()?;
        let path = self.record_path(oid);
        let file = match read_record_file(&path) {
            Ok(file) => file,
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.not_found(oid));
            }
            Err(e) => return Err(e),
        };
        check_oid(&path, &file, oid)?;
        Ok(file.record)
    }

    fn version(&self, oid: Oid) -> StoreResult<Option<u64>> {
        self.check_live()?;
        Ok(self.versions.get(oid))
    }

    fn oids(&self) -> StoreResult<Vec<Oid>> {
        self.check_live()?;
        Ok(self.order.read().expect("bucket order poisoned").clone())
    }

    fn len(&self) -> StoreResult<usize> {
        self.check_live()?;
        Ok(self.order.read().expect("bucket order poisoned").len())
    }

    fn write_record(&self, record: &Lxp) -> StoreResult<u64> {
        self.check_live()?;
        let oid = record_oid(record)?;
        let version = self.versions.next(oid);
        self.write_at(oid, record, version)?;
        Ok(version)
    }

    fn restore_record(&self, record: &Lxp, version: u64) -> StoreResult<()> {
        self.check_live()?;
        self.write_at(record_oid(record)?, record, version)
    }

    fn remove_record(&self, oid: Oid) -> StoreResult<()> {
        self.check_live()?;
        let Some(version) = self.versions.get(oid) else {
            return Err(self.not_found(oid));
        };
        remove_if_exists(&self.record_path(oid)).map_err(|e| self.write_failure(e))?;
        if self.ctx.sync == SyncMode::EveryWrite {
            sync_dir(&self.ident.path).map_err(|e| self.write_failure(e))?;
        }
        self.versions.kill(oid, version);
        self.order
            .write()
            .expect("bucket order poisoned")
            .retain(|o| *o != oid);
        debug!(bucket = %self.ident.id, %oid, "record removed");
        Ok(())
    }

    fn destroy(&self) -> StoreResult<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match fs::remove_dir_all(&self.ident.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                self.deleted.store(false, Ordering::Release);
                return Err(e.into());
            }
        }
        self.versions.clear();
        self.order.write().expect("bucket order poisoned").clear();
        debug!(bucket = %self.ident.id, "directory bucket destroyed");
        Ok(())
    }
}
