use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::oid::Oid;
use crate::type_label::TypeRef;
use crate::value::LxpValue;

/// An LXP record: an ordered label→value map with an object id and an
/// optional type reference.
///
/// Labels are unique within a record and keep their first-insertion order.
/// Overwriting a label replaces its value in place. The OID is `None` until
/// the record is first persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Lxp {
    oid: Option<Oid>,
    #[serde(default, rename = "type")]
    type_ref: Option<TypeRef>,
    fields: Vec<(String, LxpValue)>,
}

impl Lxp {
    /// Create an empty, untyped record with no OID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record tagged with a type.
    pub fn typed(type_ref: TypeRef) -> Self {
        Self {
            type_ref: Some(type_ref),
            ..Self::default()
        }
    }

    /// Builder-style [`put`](Self::put).
    pub fn with(mut self, label: impl Into<String>, value: impl Into<LxpValue>) -> Self {
        self.put(label, value);
        self
    }

    pub fn oid(&self) -> Option<Oid> {
        self.oid
    }

    /// Assign the record's OID. Buckets call this on first persistence.
    pub fn set_oid(&mut self, oid: Oid) {
        self.oid = Some(oid);
    }

    /// Insert or overwrite a label. Returns the previous value, if any.
    pub fn put(&mut self, label: impl Into<String>, value: impl Into<LxpValue>) -> Option<LxpValue> {
        let label = label.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(l, _)| *l == label) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((label, value));
                None
            }
        }
    }

    /// Read a label's value.
    pub fn get(&self, label: &str) -> Result<&LxpValue, RecordError> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
            .ok_or_else(|| RecordError::LabelNotFound(label.to_string()))
    }

    /// Remove a label, returning its value.
    pub fn remove(&mut self, label: &str) -> Result<LxpValue, RecordError> {
        let pos = self
            .fields
            .iter()
            .position(|(l, _)| l == label)
            .ok_or_else(|| RecordError::LabelNotFound(label.to_string()))?;
        Ok(self.fields.remove(pos).1)
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.fields.iter().any(|(l, _)| l == label)
    }

    /// Labels in insertion order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(l, _)| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LxpValue)> {
        self.fields.iter().map(|(l, v)| (l.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_type(&self) -> bool {
        self.type_ref.is_some()
    }

    pub fn get_type(&self) -> Option<&TypeRef> {
        self.type_ref.as_ref()
    }

    pub fn set_type(&mut self, type_ref: TypeRef) {
        self.type_ref = Some(type_ref);
    }

    pub fn clear_type(&mut self) {
        self.type_ref = None;
    }

    /// Compare labels and values only, ignoring OID and type.
    pub fn same_fields(&self, other: &Lxp) -> bool {
        self.fields == other.fields
    }
}
