//! Persistence core of the LXP object store.
//!
//! A [`Store`] owns a directory tree of repositories and buckets, hands out
//! store-wide unique OIDs, keeps the type registry, and runs optimistic
//! transactions whose commits are made crash-safe by a log bucket.
//!
//! # Key Types
//!
//! - [`Store`] - root object owning everything below
//! - [`Repository`] - a named namespace of buckets
//! - [`Bucket`] - trait implemented by [`DirectoryBucket`] and [`IndexedBucket`]
//! - [`TypeFactory`] - explicit registry of record types
//! - [`TransactionManager`] / [`Transaction`] - buffered writes with
//!   version-stamp conflict detection
//! - [`BucketInputStream`] / [`BucketOutputStream`] - iteration and insertion

mod alloc;
pub mod bucket;
pub mod config;
pub mod error;
mod fsutil;
pub mod locks;
pub mod names;
pub mod repository;
pub mod store;
pub mod stream;
pub mod txn;
pub mod types;

pub use alloc::{OidAllocator, StoreMeta, FORMAT_VERSION};
pub use bucket::{
    Bucket, BucketContext, BucketHandle, BucketKind, DirectoryBucket, IndexedBucket,
};
pub use config::{StoreConfig, SyncMode};
pub use error::{StoreError, StoreResult};
pub use locks::OidLocks;
pub use repository::Repository;
pub use store::Store;
pub use stream::{BucketInputStream, BucketOutputStream, BucketStreams};
pub use txn::{
    LogEntry, LogOp, LogWrite, Transaction, TransactionId, TransactionManager, TransactionState,
};
pub use types::TypeFactory;
