use thiserror::Error;

/// Errors produced by record and descriptor operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("label not found: {0}")]
    LabelNotFound(String),

    #[error("invalid object id: {0}")]
    InvalidOid(String),

    #[error("invalid type descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unsupported JSON value for label {label}: {reason}")]
    UnsupportedJson { label: String, reason: String },
}
