//! Iteration and insertion adapters over a bucket.

use lxp_types::{Lxp, Oid};

use crate::bucket::BucketHandle;
use crate::error::{StoreError, StoreResult};

/// A lazy, finite, restartable sequence over a bucket's records.
///
/// The set of OIDs is captured when the stream is created; records are read
/// one at a time as the stream advances. Records deleted after creation are
/// skipped, records added after creation are not visited.
pub struct BucketInputStream {
    bucket: BucketHandle,
    oids: Vec<Oid>,
    pos: usize,
}

impl BucketInputStream {
    pub fn new(bucket: BucketHandle) -> StoreResult<Self> {
        let oids = bucket.oids()?;
        Ok(Self {
            bucket,
            oids,
            pos: 0,
        })
    }

    /// Restart from the first record.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// OIDs captured at creation, in bucket order.
    pub fn oids(&self) -> &[Oid] {
        &self.oids
    }
}

impl Iterator for BucketInputStream {
    type Item = StoreResult<Lxp>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&oid) = self.oids.get(self.pos) {
            self.pos += 1;
            match self.bucket.get_object_by_id(oid) {
                Err(StoreError::ObjectNotFound { .. }) => continue,
                other => return Some(other),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.oids.len().saturating_sub(self.pos)))
    }
}

/// A write sink persisting every added record into a bucket.
pub struct BucketOutputStream {
    bucket: BucketHandle,
}

impl BucketOutputStream {
    pub fn new(bucket: BucketHandle) -> Self {
        Self { bucket }
    }

    /// Persist `record`, returning its OID.
    pub fn add(&mut self, mut record: Lxp) -> StoreResult<Oid> {
        self.bucket.make_persistent(&mut record)
    }

    /// Persist every record, stopping at the first failure.
    pub fn add_all<I>(&mut self, records: I) -> StoreResult<Vec<Oid>>
    where
        I: IntoIterator<Item = Lxp>,
    {
        records.into_iter().map(|r| self.add(r)).collect()
    }
}

/// Stream constructors for bucket handles.
pub trait BucketStreams {
    fn input_stream(&self) -> StoreResult<BucketInputStream>;
    fn output_stream(&self) -> BucketOutputStream;
}

impl BucketStreams for BucketHandle {
    fn input_stream(&self) -> StoreResult<BucketInputStream> {
        BucketInputStream::new(self.clone())
    }

    fn output_stream(&self) -> BucketOutputStream {
        BucketOutputStream::new(self.clone())
    }
}
