use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::bucket::{self, BucketContext, BucketHandle, BucketKind, BUCKET_META_FILE};
use crate::error::{StoreError, StoreResult};
use crate::names::validate_name;

/// A named namespace of buckets rooted at `<root>/repos/<name>`.
pub struct Repository {
    name: String,
    path: PathBuf,
    ctx: BucketContext,
    buckets: RwLock<BTreeMap<String, BucketHandle>>,
    deleted: AtomicBool,
}

impl Repository {
    pub(crate) fn create(name: &str, path: &Path, ctx: BucketContext) -> StoreResult<Self> {
        fs::create_dir_all(path)?;
        Ok(Self::empty(name, path, ctx))
    }

    /// Open an existing repository, reopening every bucket directory in it.
    pub(crate) fn open(name: &str, path: &Path, ctx: BucketContext) -> StoreResult<Self> {
        let repo = Self::empty(name, path, ctx);
        let mut buckets = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(bucket_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let bucket_path = entry.path();
            if !bucket_path.join(BUCKET_META_FILE).exists() {
                warn!(
                    repository = name,
                    path = %bucket_path.display(),
                    "directory without bucket descriptor; ignoring"
                );
                continue;
            }
            let handle = bucket::open_bucket(name, &bucket_name, &bucket_path, &repo.ctx)?;
            buckets.insert(bucket_name, handle);
        }
        debug!(repository = name, buckets = buckets.len(), "opened repository");
        *repo.buckets.write().expect("bucket table poisoned") = buckets;
        Ok(repo)
    }

    fn empty(name: &str, path: &Path, ctx: BucketContext) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            ctx,
            buckets: RwLock::new(BTreeMap::new()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn check_live(&self) -> StoreResult<()> {
        if self.is_deleted() {
            return Err(StoreError::RepositoryNotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Create a bucket of the given kind.
    pub fn make_bucket(&self, name: &str, kind: BucketKind) -> StoreResult<BucketHandle> {
        self.check_live()?;
        validate_name(name)?;
        let mut buckets = self.buckets.write().expect("bucket table poisoned");
        if buckets.contains_key(name) {
            return Err(StoreError::BucketExists {
                repository: self.name.clone(),
                bucket: name.to_string(),
            });
        }
        let handle = bucket::create_bucket(&self.name, name, &self.path.join(name), kind, &self.ctx)?;
        buckets.insert(name.to_string(), handle.clone());
        info!(repository = %self.name, bucket = name, %kind, "bucket created");
        Ok(handle)
    }

    pub fn get_bucket(&self, name: &str) -> StoreResult<BucketHandle> {
        self.check_live()?;
        self.buckets
            .read()
            .expect("bucket table poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::bucket_not_found(&self.name, name))
    }

    /// Delete a bucket and every record in it.
    ///
    /// Handles obtained earlier keep failing with
    /// [`StoreError::BucketNotFound`] afterwards.
    pub fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        self.check_live()?;
        let mut buckets = self.buckets.write().expect("bucket table poisoned");
        let handle = buckets
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::bucket_not_found(&self.name, name))?;
        handle.destroy()?;
        buckets.remove(name);
        info!(repository = %self.name, bucket = name, "bucket deleted");
        Ok(())
    }

    /// Bucket names, sorted.
    pub fn bucket_names(&self) -> StoreResult<Vec<String>> {
        self.check_live()?;
        Ok(self
            .buckets
            .read()
            .expect("bucket table poisoned")
            .keys()
            .cloned()
            .collect())
    }

    pub fn contains_bucket(&self, name: &str) -> bool {
        !self.is_deleted()
            && self
                .buckets
                .read()
                .expect("bucket table poisoned")
                .contains_key(name)
    }

    /// Destroy every bucket, then the repository directory.
    pub(crate) fn destroy(&self) -> StoreResult<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut buckets = self.buckets.write().expect("bucket table poisoned");
        for handle in buckets.values() {
            handle.destroy()?;
        }
        buckets.clear();
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("buckets", &self.buckets.read().map(|b| b.len()).unwrap_or(0))
            .finish()
    }
}
