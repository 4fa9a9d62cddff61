use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use lxp_types::{Oid, TypeLabel};
use tracing::{debug, info};

use crate::alloc::OidAllocator;
use crate::bucket::{open_or_create_bucket, BucketContext, BucketHandle, BucketKind};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::locks::OidLocks;
use crate::names::validate_name;
use crate::repository::Repository;
use crate::txn::{replay, TransactionManager};
use crate::types::TypeFactory;

/// Store metadata file under the root.
pub const META_FILE: &str = "store.json";
/// Directory of the reserved types bucket.
pub const TYPES_DIR: &str = "types";
/// Directory of the reserved transaction log bucket.
pub const LOG_DIR: &str = "txlog";
/// Directory holding one sub-directory per repository.
pub const REPOS_DIR: &str = "repos";
/// Repository name under which the reserved buckets are addressed.
pub const RESERVED_REPOSITORY: &str = "_store";

struct StoreInner {
    config: StoreConfig,
    ctx: BucketContext,
    repositories: RwLock<BTreeMap<String, Arc<Repository>>>,
    types_bucket: BucketHandle,
    manager: TransactionManager,
}

/// The root of a persistence hierarchy.
///
/// Owns the repository namespace, the OID allocator, the type registry, and
/// the transaction log. Cheap to clone; clones share state.
///
/// # Example
///
/// ```no_run
/// use lxp_store::{BucketKind, Store, StoreConfig};
/// use lxp_types::Lxp;
///
/// let store = Store::open(StoreConfig::new("/var/lib/lxp"))?;
/// let repo = store.make_repository("census")?;
/// let people = repo.make_bucket("people", BucketKind::Directory)?;
/// let oid = people.make_persistent(&mut Lxp::new().with("age", "42"))?;
/// assert_eq!(people.get_object_by_id(oid)?.get("age")?.as_str(), Some("42"));
/// # Ok::<(), lxp_store::StoreError>(())
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open the store at `config.root`, creating it if absent.
    ///
    /// Reopens every repository and bucket found on disk, replays log
    /// entries left by interrupted commits, then reloads registered types.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let root = config.root.clone();
        fs::create_dir_all(root.join(REPOS_DIR))?;

        let ctx = BucketContext {
            oids: Arc::new(OidAllocator::open(&root.join(META_FILE), config.sync)?),
            types: Arc::new(TypeFactory::new()),
            locks: Arc::new(OidLocks::new()),
            sync: config.sync,
        };
        let types_bucket = open_or_create_bucket(
            RESERVED_REPOSITORY,
            TYPES_DIR,
            &root.join(TYPES_DIR),
            BucketKind::Directory,
            &ctx,
        )?;
        let log = open_or_create_bucket(
            RESERVED_REPOSITORY,
            LOG_DIR,
            &root.join(LOG_DIR),
            BucketKind::Directory,
            &ctx,
        )?;

        let mut repositories = BTreeMap::new();
        for entry in fs::read_dir(root.join(REPOS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let repo = Repository::open(&name, &entry.path(), ctx.clone())?;
            repositories.insert(name, Arc::new(repo));
        }

        let replayed = replay(log.as_ref(), |repository, bucket| {
            if repository == RESERVED_REPOSITORY && bucket == TYPES_DIR {
                return Ok(Some(types_bucket.clone()));
            }
            match repositories.get(repository) {
                Some(repo) if repo.contains_bucket(bucket) => repo.get_bucket(bucket).map(Some),
                _ => Ok(None),
            }
        })?;
        if replayed > 0 {
            info!(replayed, "recovered interrupted commits");
        }

        let types = ctx.types.load_from(types_bucket.as_ref())?;
        let manager = TransactionManager::new(log);

        info!(
            root = %root.display(),
            repositories = repositories.len(),
            types,
            next_oid = %ctx.oids.peek(),
            "store opened"
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                ctx,
                repositories: RwLock::new(repositories),
                types_bucket,
                manager,
            }),
        })
    }

    /// Open a store at `root` with default settings.
    pub fn open_at(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open(StoreConfig::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Create a repository. Fails with [`StoreError::RepositoryExists`] if
    /// the name is taken.
    pub fn make_repository(&self, name: &str) -> StoreResult<Arc<Repository>> {
        validate_name(name)?;
        let mut repos = self.inner.repositories.write().expect("repository table poisoned");
        if repos.contains_key(name) {
            return Err(StoreError::RepositoryExists(name.to_string()));
        }
        let path = self.root().join(REPOS_DIR).join(name);
        let repo = Arc::new(Repository::create(name, &path, self.inner.ctx.clone())?);
        repos.insert(name.to_string(), Arc::clone(&repo));
        info!(repository = name, "repository created");
        Ok(repo)
    }

    pub fn get_repository(&self, name: &str) -> StoreResult<Arc<Repository>> {
        self.inner
            .repositories
            .read()
            .expect("repository table poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::RepositoryNotFound(name.to_string()))
    }

    /// Delete a repository with all its buckets and records.
    pub fn delete_repository(&self, name: &str) -> StoreResult<()> {
        let mut repos = self.inner.repositories.write().expect("repository table poisoned");
        let repo = repos
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::RepositoryNotFound(name.to_string()))?;
        repo.destroy()?;
        repos.remove(name);
        info!(repository = name, "repository deleted");
        Ok(())
    }

    /// Repository names, sorted.
    pub fn repository_names(&self) -> Vec<String> {
        self.inner
            .repositories
            .read()
            .expect("repository table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn contains_repository(&self, name: &str) -> bool {
        self.inner
            .repositories
            .read()
            .expect("repository table poisoned")
            .contains_key(name)
    }

    /// Shortcut for `get_repository(repository)?.get_bucket(bucket)`.
    pub fn bucket(&self, repository: &str, bucket: &str) -> StoreResult<BucketHandle> {
        self.get_repository(repository)?.get_bucket(bucket)
    }

    /// Next unused OID. Never returns the same value twice, across threads
    /// and restarts.
    pub fn allocate_oid(&self) -> StoreResult<Oid> {
        let oid = self.inner.ctx.oids.allocate()?;
        debug!(%oid, "oid allocated");
        Ok(oid)
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.inner.manager
    }

    pub fn type_factory(&self) -> &TypeFactory {
        &self.inner.ctx.types
    }

    /// The reserved bucket holding type descriptors.
    pub fn types_bucket(&self) -> &BucketHandle {
        &self.inner.types_bucket
    }

    /// Register a type, persisting its descriptor into the types bucket.
    pub fn create_type(&self, source: &str, name: &str) -> StoreResult<Arc<TypeLabel>> {
        self.inner
            .ctx
            .types
            .create_type(source, name, self.inner.types_bucket.as_ref())
    }

    pub fn type_with_name(&self, name: &str) -> Option<Arc<TypeLabel>> {
        self.inner.ctx.types.type_with_name(name)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root())
            .field("repositories", &self.repository_names())
            .field("types", &self.inner.ctx.types)
            .finish()
    }
}
