use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use lxp_types::Oid;

const STRIPES: usize = 64;

/// Striped lock table serializing durable mutations per `(bucket, oid)`.
///
/// Shared by every bucket of a store. Two operations on the same OID in the
/// same bucket always hash to the same stripe; unrelated keys usually do
/// not, so they proceed in parallel.
pub struct OidLocks {
    stripes: Vec<Mutex<()>>,
}

impl OidLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(bucket: &str, oid: Oid) -> usize {
        let mut hasher = DefaultHasher::new();
        bucket.hash(&mut hasher);
        oid.hash(&mut hasher);
        (hasher.finish() % STRIPES as u64) as usize
    }

    /// Lock a single key.
    pub fn lock(&self, bucket: &str, oid: Oid) -> MutexGuard<'_, ()> {
        self.stripes[Self::stripe(bucket, oid)]
            .lock()
            .expect("oid lock poisoned")
    }

    /// Lock every key in `keys`, in stripe order so concurrent callers
    /// cannot deadlock.
    pub fn lock_all<'a, I>(&self, keys: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = (&'a str, Oid)>,
    {
        let mut indices: Vec<usize> = keys
            .into_iter()
            .map(|(bucket, oid)| Self::stripe(bucket, oid))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|i| self.stripes[i].lock().expect("oid lock poisoned"))
            .collect()
    }
}

impl Default for OidLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OidLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_key_same_stripe() {
        assert_eq!(
            OidLocks::stripe("repo/b", Oid::new(5)),
            OidLocks::stripe("repo/b", Oid::new(5))
        );
    }

    #[test]
    fn lock_all_dedups_colliding_keys() {
        let locks = OidLocks::new();
        let guards = locks.lock_all([("r/b", Oid::new(1)), ("r/b", Oid::new(1))]);
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn serializes_same_key() {
        let locks = Arc::new(OidLocks::new());
        let counter = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _g = locks.lock("r/b", Oid::new(1));
                    counter.lock().unwrap().push(i);
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(counter.lock().unwrap().len(), 4);
    }
}
