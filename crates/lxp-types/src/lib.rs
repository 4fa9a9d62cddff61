//! Foundation types for the LXP object store.
//!
//! Every other LXP crate depends on `lxp-types`. Nothing here touches the
//! filesystem: these are the in-memory shapes that buckets persist.
//!
//! # Key Types
//!
//! - [`Oid`] - store-wide unique object identifier
//! - [`LxpValue`] - a primitive value, list, or reference to another record
//! - [`Lxp`] - an ordered label→value record with an optional type reference
//! - [`TypeLabel`] - a registered schema descriptor used for validation
//! - [`TypeRef`] - the persisted link from a record to its descriptor

pub mod error;
pub mod json;
pub mod oid;
pub mod record;
pub mod type_label;
pub mod value;

pub use error::RecordError;
pub use oid::Oid;
pub use record::Lxp;
pub use type_label::{TypeLabel, TypeRef};
pub use value::LxpValue;
