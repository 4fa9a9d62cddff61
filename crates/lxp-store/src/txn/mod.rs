//! Optimistic transactions over buckets.
//!
//! A [`Transaction`] buffers writes privately and records the version stamp
//! of every record it touches. [`Transaction::commit`] checks those stamps
//! under the OID locks, writes the buffer to the log bucket, applies it, and
//! removes the log entry. Entries left in the log by a crash are replayed
//! when the store is next opened.

mod log;
mod manager;
mod transaction;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use log::{LogEntry, LogOp, LogWrite};
pub use manager::TransactionManager;
pub use transaction::Transaction;

pub(crate) use log::replay;

/// Unique identifier for a transaction (UUID v7 for time-ordering).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(uuid::Uuid);

impl TransactionId {
    /// Generate a new time-ordered transaction ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Short representation (first 8 characters of the UUID).
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.short_id())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a transaction: active → {committed | rolled back}.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}
