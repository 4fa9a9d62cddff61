use std::path::PathBuf;

use lxp_types::{Oid, RecordError};

use crate::txn::{TransactionId, TransactionState};

/// Errors from store, repository, bucket, and transaction operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("bucket already exists: {repository}/{bucket}")]
    BucketExists { repository: String, bucket: String },

    #[error("bucket not found: {repository}/{bucket}")]
    BucketNotFound { repository: String, bucket: String },

    #[error("object {oid} not found in bucket {bucket}")]
    ObjectNotFound { bucket: String, oid: Oid },

    /// Label lookup and descriptor errors from the record layer.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// A typed record lacks labels its type requires, or names an unknown type.
    #[error("record does not satisfy type {type_name}: {reason}")]
    TypeValidation { type_name: String, reason: String },

    #[error("type already registered: {0}")]
    TypeAlreadyRegistered(String),

    /// I/O failure while writing a record. No partial record is visible.
    #[error("write to bucket {bucket} failed: {source}")]
    BucketWrite {
        bucket: String,
        #[source]
        source: std::io::Error,
    },

    /// A transaction could not be made durable. Its writes were not applied.
    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("transaction {transaction} conflicts on {bucket}/{oid}")]
    ConflictDetected {
        transaction: TransactionId,
        bucket: String,
        oid: Oid,
    },

    #[error("transaction {transaction} is {state}, expected active")]
    IllegalTransactionState {
        transaction: TransactionId,
        state: TransactionState,
    },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// On-disk data could not be decoded.
    #[error("corrupt data at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Replaying the transaction log at open failed.
    #[error("transaction log recovery failed: {0}")]
    Recovery(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Lookup failures: missing repository, bucket, object, or label.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RepositoryNotFound(_)
                | Self::BucketNotFound { .. }
                | Self::ObjectNotFound { .. }
                | Self::Record(RecordError::LabelNotFound(_))
        )
    }

    /// Name collisions and optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::RepositoryExists(_)
                | Self::BucketExists { .. }
                | Self::TypeAlreadyRegistered(_)
                | Self::ConflictDetected { .. }
                | Self::IllegalTransactionState { .. }
        )
    }

    /// Caller input rejected before any I/O.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::TypeValidation { .. }
                | Self::InvalidName { .. }
                | Self::Record(RecordError::InvalidOid(_))
                | Self::Record(RecordError::InvalidDescriptor(_))
                | Self::Record(RecordError::UnsupportedJson { .. })
        )
    }

    pub(crate) fn bucket_not_found(repository: &str, bucket: &str) -> Self {
        Self::BucketNotFound {
            repository: repository.to_string(),
            bucket: bucket.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::RepositoryNotFound("r".into()).is_not_found());
        assert!(StoreError::Record(RecordError::LabelNotFound("x".into())).is_not_found());
        assert!(StoreError::BucketExists {
            repository: "r".into(),
            bucket: "b".into()
        }
        .is_conflict());
        assert!(StoreError::TypeValidation {
            type_name: "t".into(),
            reason: "missing labels: a".into()
        }
        .is_invalid_input());
        assert!(!StoreError::StoreFailure("disk".into()).is_not_found());
    }

    #[test]
    fn display_mentions_location() {
        let err = StoreError::ObjectNotFound {
            bucket: "repo/b".into(),
            oid: Oid::new(1),
        };
        assert_eq!(err.to_string(), "object 1 not found in bucket repo/b");
    }
}
