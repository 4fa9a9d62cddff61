use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use lxp_types::{Lxp, Oid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::frame::{FrameFile, FrameSlot, HEADER_SIZE};
use super::{record_oid, Bucket, BucketContext, BucketIdent, BucketKind, VersionTable};
use crate::error::{StoreError, StoreResult};

/// Name of the data file inside an indexed bucket directory.
pub const DATA_FILE: &str = "records.dat";

/// Payload of one frame in the data file.
#[derive(Serialize, Deserialize)]
enum Frame {
    Put { version: u64, record: Lxp },
    Delete { oid: Oid, version: u64 },
}

fn encode(frame: &Frame) -> StoreResult<Vec<u8>> {
    bincode::serialize(frame).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn frame_bytes(slot: &FrameSlot) -> u64 {
    HEADER_SIZE + u64::from(slot.len)
}

/// OID → frame index plus the number of bytes no longer reachable from it.
#[derive(Default)]
struct Index {
    slots: BTreeMap<Oid, FrameSlot>,
    garbage: u64,
}

/// Bucket storing every record in one append-only data file.
///
/// Writes and deletes append a frame; the in-memory index points at the
/// latest put frame of each live OID and is rebuilt by scanning the file on
/// open. Iteration follows OID order. Superseded frames stay in the file
/// until [`compact`](Bucket::compact) rewrites it.
pub struct IndexedBucket {
    ident: BucketIdent,
    ctx: BucketContext,
    data: FrameFile,
    versions: VersionTable,
    // Held for writing across append + index update so compaction never
    // observes a frame that is not yet indexed.
    index: RwLock<Index>,
    deleted: AtomicBool,
}

impl IndexedBucket {
    pub(crate) fn open(ident: BucketIdent, ctx: BucketContext) -> StoreResult<Self> {
        let path = ident.path.join(DATA_FILE);
        let (data, frames) = FrameFile::open(&path, ctx.sync)?;
        let versions = VersionTable::default();
        let mut index = Index::default();

        for scanned in frames {
            let frame: Frame = bincode::deserialize(&scanned.payload).map_err(|e| {
                StoreError::corrupt(&path, format!("frame at {}: {e}", scanned.slot.offset))
            })?;
            match frame {
                Frame::Put { version, record } => {
                    let oid = record.oid().ok_or_else(|| {
                        StoreError::corrupt(
                            &path,
                            format!("record at {} has no oid", scanned.slot.offset),
                        )
                    })?;
                    if let Some(old) = index.slots.insert(oid, scanned.slot) {
                        index.garbage += frame_bytes(&old);
                    }
                    versions.set(oid, version);
                }
                Frame::Delete { oid, version } => {
                    if let Some(old) = index.slots.remove(&oid) {
                        index.garbage += frame_bytes(&old);
                    }
                    index.garbage += frame_bytes(&scanned.slot);
                    versions.kill(oid, version);
                }
            }
        }

        debug!(
            bucket = %ident.id,
            records = index.slots.len(),
            garbage = index.garbage,
            "opened indexed bucket"
        );
        Ok(Self {
            ident,
            ctx,
            data,
            versions,
            index: RwLock::new(index),
            deleted: AtomicBool::new(false),
        })
    }

    /// Bytes in the data file that a compaction would reclaim.
    pub fn garbage_bytes(&self) -> u64 {
        self.index.read().expect("bucket index poisoned").garbage
    }

    fn write_at(&self, oid: Oid, record: &Lxp, version: u64) -> StoreResult<()> {
        let payload = encode(&Frame::Put {
            version,
            record: record.clone(),
        })?;

        let mut index = self.index.write().expect("bucket index poisoned");
        let slot = self
            .data
            .append(&payload)
            .map_err(|e| self.write_failure(e))?;
        if let Some(old) = index.slots.insert(oid, slot) {
            index.garbage += frame_bytes(&old);
        }
        self.versions.set(oid, version);
        drop(index);

        debug!(bucket = %self.ident.id, %oid, version, offset = slot.offset, "record appended");
        Ok(())
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

impl Bucket for IndexedBucket {
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
        BucketKind::Indexed
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
        Ok(self
            .index
            .read()
            .expect("bucket index poisoned")
            .slots
            .contains_key(&oid))
    }

    fn get_object_by_id(&self, oid: Oid) -> StoreResult<Lxp> {
        self.check_live()?;
        let index = self.index.read().expect("bucket index poisoned");
        let slot = *index.slots.get(&oid).ok_or_else(|| self.not_found(oid))?;
        let payload = self.data.read(slot)?;
        drop(index);

        let path = self.ident.path.join(DATA_FILE);
        match bincode::deserialize::<Frame>(&payload) {
            Ok(Frame::Put { record, .. }) if record.oid() == Some(oid) => Ok(record),
            Ok(_) => Err(StoreError::corrupt(
                path,
                format!("index entry for {oid} does not point at its record"),
            )),
            Err(e) => Err(StoreError::corrupt(path, e.to_string())),
        }
    }

    fn version(&self, oid: Oid) -> StoreResult<Option<u64>> {
        self.check_live()?;
        Ok(self.versions.get(oid))
    }

    fn oids(&self) -> StoreResult<Vec<Oid>> {
        self.check_live()?;
        Ok(self
            .index
            .read()
            .expect("bucket index poisoned")
            .slots
            .keys()
            .copied()
            .collect())
    }

    fn len(&self) -> StoreResult<usize> {
        self.check_live()?;
        Ok(self.index.read().expect("bucket index poisoned").slots.len())
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
        let payload = encode(&Frame::Delete { oid, version })?;

        let mut index = self.index.write().expect("bucket index poisoned");
        let tombstone = self
            .data
            .append(&payload)
            .map_err(|e| self.write_failure(e))?;
        if let Some(old) = index.slots.remove(&oid) {
            index.garbage += frame_bytes(&old);
        }
        index.garbage += frame_bytes(&tombstone);
        self.versions.kill(oid, version);
        drop(index);

        debug!(bucket = %self.ident.id, %oid, "tombstone appended");
        Ok(())
    }

    fn compact(&self) -> StoreResult<u64> {
        self.check_live()?;
        let mut index = self.index.write().expect("bucket index poisoned");
        if index.garbage == 0 {
            return Ok(0);
        }

        let before = self.data.offset();
        let oids: Vec<Oid> = index.slots.keys().copied().collect();
        let mut payloads = Vec::with_capacity(oids.len());
        for oid in &oids {
            payloads.push(self.data.read(index.slots[oid])?);
        }
        // Tombstones stay so deleted stamps survive a reopen.
        let dead = self.versions.dead_entries();
        for (oid, version) in &dead {
            payloads.push(encode(&Frame::Delete {
                oid: *oid,
                version: *version,
            })?);
        }
        let slots = self.data.rewrite(&payloads)?;
        index.slots = oids.into_iter().zip(slots).collect();
        index.garbage = 0;
        let after = self.data.offset();
        drop(index);

        let reclaimed = before.saturating_sub(after);
        info!(
            bucket = %self.ident.id,
            reclaimed,
            tombstones = dead.len(),
            "indexed bucket compacted"
        );
        Ok(reclaimed)
    }

    fn destroy(&self) -> StoreResult<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut index = self.index.write().expect("bucket index poisoned");
        match fs::remove_dir_all(&self.ident.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                self.deleted.store(false, Ordering::Release);
                return Err(e.into());
            }
        }
        *index = Index::default();
        self.versions.clear();
        debug!(bucket = %self.ident.id, "indexed bucket destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::test_support::context;
    use crate::bucket::{create_bucket, open_bucket, BucketHandle};
    use lxp_types::LxpValue;
    use std::fs::OpenOptions;

    fn setup() -> (tempfile::TempDir, BucketHandle) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let bucket =
            create_bucket("repo", "idx", &dir.path().join("idx"), BucketKind::Indexed, &ctx)
                .unwrap();
        (dir, bucket)
    }

    fn data_len(bucket: &BucketHandle) -> u64 {
        fs::metadata(bucket.path().join(DATA_FILE)).unwrap().len()
    }

    #[test]
    fn persist_and_read_back() {
        let (_dir, bucket) = setup();
        let mut record = Lxp::new()
            .with("age", "42")
            .with("score", 1.5)
            .with("tags", vec!["a", "b"]);
        let oid = bucket.make_persistent(&mut record).unwrap();
        assert_eq!(bucket.get_object_by_id(oid).unwrap(), record);
        assert_eq!(
            bucket.get_object_by_id(oid).unwrap().get("score").unwrap(),
            &LxpValue::Float(1.5)
        );
    }

    #[test]
    fn iteration_follows_oid_order() {
        let (_dir, bucket) = setup();
        let reserved = bucket.context().oids().allocate().unwrap();
        let later = bucket.make_persistent(&mut Lxp::new()).unwrap();
        let mut early = Lxp::new();
        early.set_oid(reserved);
        bucket.make_persistent(&mut early).unwrap();
        assert_eq!(bucket.oids().unwrap(), vec![reserved, later]);
    }

    #[test]
    fn overwrite_and_delete_are_appended() {
        let (_dir, bucket) = setup();
        let mut record = Lxp::new().with("k", 1i64);
        let oid = bucket.make_persistent(&mut record).unwrap();
        let first = data_len(&bucket);
        record.put("k", 2i64);
        bucket.make_persistent(&mut record).unwrap();
        assert!(data_len(&bucket) > first);
        assert_eq!(bucket.version(oid).unwrap(), Some(2));
        assert_eq!(bucket.get_object_by_id(oid).unwrap().get("k").unwrap(), &LxpValue::Int(2));

        bucket.delete(oid).unwrap();
        assert!(!bucket.contains(oid).unwrap());
        assert!(matches!(
            bucket.get_object_by_id(oid),
            Err(StoreError::ObjectNotFound { .. })
        ));
        assert!(matches!(bucket.delete(oid), Err(StoreError::ObjectNotFound { .. })));
    }

    #[test]
    fn reopen_rebuilds_index_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = dir.path().join("idx");
        let bucket = create_bucket("repo", "idx", &path, BucketKind::Indexed, &ctx).unwrap();
        let mut kept = Lxp::new().with("k", "kept");
        let kept_oid = bucket.make_persistent(&mut kept).unwrap();
        bucket.make_persistent(&mut kept).unwrap();
        let gone = bucket.make_persistent(&mut Lxp::new().with("k", "gone")).unwrap();
        bucket.delete(gone).unwrap();
        drop(bucket);

        let bucket = open_bucket("repo", "idx", &path, &ctx).unwrap();
        assert_eq!(bucket.oids().unwrap(), vec![kept_oid]);
        assert_eq!(bucket.version(kept_oid).unwrap(), Some(2));
        assert_eq!(bucket.get_object_by_id(kept_oid).unwrap(), kept);
        assert!(!bucket.contains(gone).unwrap());

        // a re-created OID continues counting from the tombstone
        let mut again = Lxp::new();
        again.set_oid(gone);
        bucket.make_persistent(&mut again).unwrap();
        assert_eq!(bucket.version(gone).unwrap(), Some(2));
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = dir.path().join("idx");
        let bucket = create_bucket("repo", "idx", &path, BucketKind::Indexed, &ctx).unwrap();
        let a = bucket.make_persistent(&mut Lxp::new().with("n", 1i64)).unwrap();
        let b = bucket.make_persistent(&mut Lxp::new().with("n", 2i64)).unwrap();
        drop(bucket);

        let data = path.join(DATA_FILE);
        let len = fs::metadata(&data).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&data)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let bucket = open_bucket("repo", "idx", &path, &ctx).unwrap();
        assert!(bucket.contains(a).unwrap());
        assert!(!bucket.contains(b).unwrap());
        let c = bucket.make_persistent(&mut Lxp::new().with("n", 3i64)).unwrap();
        drop(bucket);

        let bucket = open_bucket("repo", "idx", &path, &ctx).unwrap();
        assert_eq!(bucket.oids().unwrap(), vec![a, c]);
    }

    #[test]
    fn compact_keeps_live_records_only() {
        let (_dir, bucket) = setup();
        let mut live = Lxp::new().with("k", "live");
        let live_oid = bucket.make_persistent(&mut live).unwrap();
        for i in 0..10i64 {
            live.put("n", i);
            bucket.make_persistent(&mut live).unwrap();
        }
        let dead = bucket.make_persistent(&mut Lxp::new().with("k", "dead")).unwrap();
        bucket.delete(dead).unwrap();

        let before = data_len(&bucket);
        let reclaimed = bucket.compact().unwrap();
        assert!(reclaimed > 0);
        assert_eq!(data_len(&bucket), before - reclaimed);
        assert_eq!(bucket.oids().unwrap(), vec![live_oid]);
        assert_eq!(bucket.get_object_by_id(live_oid).unwrap(), live);
        assert_eq!(bucket.version(live_oid).unwrap(), Some(11));

        // nothing left to reclaim
        assert_eq!(bucket.compact().unwrap(), 0);

        // appends after compaction land after the rewritten frames
        let next = bucket.make_persistent(&mut Lxp::new().with("k", "next")).unwrap();
        assert_eq!(bucket.oids().unwrap(), vec![live_oid, next]);
    }

    #[test]
    fn compact_keeps_deleted_stamps_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let path = dir.path().join("idx");
        let bucket = create_bucket("repo", "idx", &path, BucketKind::Indexed, &ctx).unwrap();
        let mut record = Lxp::new().with("k", 1i64);
        let oid = bucket.make_persistent(&mut record).unwrap();
        record.put("k", 2i64);
        bucket.make_persistent(&mut record).unwrap();
        record.put("k", 3i64);
        bucket.make_persistent(&mut record).unwrap();
        bucket.delete(oid).unwrap();
        assert!(bucket.compact().unwrap() > 0);
        drop(bucket);

        let bucket = open_bucket("repo", "idx", &path, &ctx).unwrap();
        assert!(!bucket.contains(oid).unwrap());
        let mut again = Lxp::new().with("k", 4i64);
        again.set_oid(oid);
        bucket.make_persistent(&mut again).unwrap();
        assert_eq!(bucket.version(oid).unwrap(), Some(4));
    }

    #[test]
    fn restore_puts_back_an_earlier_stamp() {
        let (_dir, bucket) = setup();
        let mut record = Lxp::new().with("k", 1i64);
        let oid = bucket.make_persistent(&mut record).unwrap();
        let original = record.clone();
        record.put("k", 2i64);
        bucket.make_persistent(&mut record).unwrap();
        assert_eq!(bucket.version(oid).unwrap(), Some(2));

        bucket.restore_record(&original, 1).unwrap();
        assert_eq!(bucket.version(oid).unwrap(), Some(1));
        assert_eq!(bucket.get_object_by_id(oid).unwrap(), original);
        let path = bucket.path().to_path_buf();
        let ctx = bucket.context().clone();
        drop(bucket);

        let bucket = open_bucket("repo", "idx", &path, &ctx).unwrap();
        assert_eq!(bucket.version(oid).unwrap(), Some(1));
        assert_eq!(bucket.get_object_by_id(oid).unwrap(), original);
    }

    #[test]
    fn null_oid_is_rejected() {
        let (_dir, bucket) = setup();
        let mut record = Lxp::new().with("k", 1i64);
        record.set_oid(Oid::null());
        assert!(matches!(
            bucket.make_persistent(&mut record),
            Err(StoreError::Record(lxp_types::RecordError::InvalidOid(_)))
        ));
        assert!(matches!(
            bucket.write_record(&record),
            Err(StoreError::Record(lxp_types::RecordError::InvalidOid(_)))
        ));
        assert!(bucket.is_empty().unwrap());
        assert_eq!(data_len(&bucket), 0);
    }

    #[test]
    fn directory_compact_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let bucket =
            create_bucket("repo", "d", &dir.path().join("d"), BucketKind::Directory, &ctx).unwrap();
        bucket.make_persistent(&mut Lxp::new()).unwrap();
        assert_eq!(bucket.compact().unwrap(), 0);
    }

    #[test]
    fn destroyed_bucket_reports_not_found() {
        let (_dir, bucket) = setup();
        let oid = bucket.make_persistent(&mut Lxp::new()).unwrap();
        bucket.destroy().unwrap();
        assert!(!bucket.path().exists());
        assert!(matches!(
            bucket.get_object_by_id(oid),
            Err(StoreError::BucketNotFound { .. })
        ));
        assert!(matches!(bucket.compact(), Err(StoreError::BucketNotFound { .. })));
    }
}
