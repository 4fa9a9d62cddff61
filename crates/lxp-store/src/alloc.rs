use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lxp_types::{Oid, RecordError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::fsutil::write_atomic;

/// Number of OIDs handed out per lease write.
const LEASE_BLOCK: u64 = 1024;

/// Current on-disk format of `store.json`.
pub const FORMAT_VERSION: u32 = 1;

/// Contents of the store metadata file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub format_version: u32,
    /// Every OID below this value may already have been handed out.
    pub oid_ceiling: u64,
}

struct Lease {
    next: u64,
    ceiling: u64,
}

/// Store-wide OID allocator.
///
/// OIDs come from an in-memory counter guarded by a mutex. Before the
/// counter passes the persisted ceiling a new ceiling is written, so after
/// a restart allocation resumes above anything previously returned. OIDs
/// are strictly increasing and never reused; a restart leaves a gap.
pub struct OidAllocator {
    path: PathBuf,
    sync: SyncMode,
    lease: Mutex<Lease>,
}

impl OidAllocator {
    /// Open the allocator backed by the metadata file at `path`, creating
    /// it for a fresh store.
    pub fn open(path: &Path, sync: SyncMode) -> StoreResult<Self> {
        let ceiling = if path.exists() {
            let meta = read_meta(path)?;
            if meta.format_version != FORMAT_VERSION {
                return Err(StoreError::corrupt(
                    path,
                    format!("unsupported format version {}", meta.format_version),
                ));
            }
            meta.oid_ceiling.max(1)
        } else {
            write_meta(path, 1, sync)?;
            1
        };
        Ok(Self {
            path: path.to_path_buf(),
            sync,
            lease: Mutex::new(Lease {
                next: ceiling,
                ceiling,
            }),
        })
    }

    /// Return the next unused OID.
    pub fn allocate(&self) -> StoreResult<Oid> {
        let mut lease = self.lease.lock().expect("oid lease poisoned");
        if lease.next >= lease.ceiling {
            let ceiling = lease
                .next
                .checked_add(LEASE_BLOCK)
                .ok_or_else(|| StoreError::StoreFailure("OID space exhausted".into()))?;
            write_meta(&self.path, ceiling, self.sync)?;
            debug!(ceiling, "OID lease extended");
            lease.ceiling = ceiling;
        }
        let oid = lease.next;
        lease.next += 1;
        Ok(Oid::new(oid))
    }

    /// Make sure `oid` is never allocated in the future.
    ///
    /// Called when a record arrives with an OID the allocator did not hand
    /// out in this process. The null OID and OIDs too close to `u64::MAX`
    /// for a lease to cover are rejected.
    pub fn reserve_through(&self, oid: Oid) -> StoreResult<()> {
        let raw = oid.as_u64();
        let covered = match raw.checked_add(LEASE_BLOCK) {
            Some(covered) if !oid.is_null() => covered,
            _ => return Err(RecordError::InvalidOid(raw.to_string()).into()),
        };
        let mut lease = self.lease.lock().expect("oid lease poisoned");
        if raw < lease.next {
            return Ok(());
        }
        if raw >= lease.ceiling {
            let ceiling = covered;
            write_meta(&self.path, ceiling, self.sync)?;
            lease.ceiling = ceiling;
        }
        lease.next = raw + 1;
        Ok(())
    }

    /// The OID the next [`allocate`](Self::allocate) call will return.
    pub fn peek(&self) -> Oid {
        Oid::new(self.lease.lock().expect("oid lease poisoned").next)
    }
}

impl std::fmt::Debug for OidAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidAllocator")
            .field("path", &self.path)
            .field("next", &self.peek())
            .finish()
    }
}

fn read_meta(path: &Path) -> StoreResult<StoreMeta> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(path, e.to_string()))
}

fn write_meta(path: &Path, oid_ceiling: u64, sync: SyncMode) -> StoreResult<()> {
    let meta = StoreMeta {
        format_version: FORMAT_VERSION,
        oid_ceiling,
    };
    let bytes =
        serde_json::to_vec_pretty(&meta).map_err(|e| StoreError::Serialization(e.to_string()))?;
    write_atomic(path, &bytes, sync)?;
    Ok(())
}
