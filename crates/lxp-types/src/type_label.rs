use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::oid::Oid;
use crate::record::Lxp;
use crate::value::LxpValue;

/// Label under which a descriptor record stores its type name.
pub const DESCRIPTOR_NAME_LABEL: &str = "type_name";
/// Label under which a descriptor record stores its required labels.
pub const DESCRIPTOR_LABELS_LABEL: &str = "labels";

/// The persisted link from a record to the descriptor of its type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    name: String,
    descriptor: Oid,
}

impl TypeRef {
    pub fn new(name: impl Into<String>, descriptor: Oid) -> Self {
        Self {
            name: name.into(),
            descriptor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OID of the descriptor record in the types bucket.
    pub fn descriptor(&self) -> Oid {
        self.descriptor
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.descriptor)
    }
}

/// A registered, immutable record schema.
///
/// A record tagged with a type is valid iff every label listed by the
/// descriptor is present. Extra labels are allowed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeLabel {
    name: String,
    descriptor: Oid,
    labels: Vec<String>,
}

impl TypeLabel {
    pub fn new(name: impl Into<String>, descriptor: Oid, labels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            descriptor,
            labels,
        }
    }

    /// Parse a descriptor source: a JSON array of label names.
    ///
    /// ```
    /// use lxp_types::TypeLabel;
    ///
    /// let labels = TypeLabel::parse_descriptor(r#"["age", "address"]"#).unwrap();
    /// assert_eq!(labels, vec!["age", "address"]);
    /// assert!(TypeLabel::parse_descriptor(r#"["age", "age"]"#).is_err());
    /// ```
    pub fn parse_descriptor(source: &str) -> Result<Vec<String>, RecordError> {
        let labels: Vec<String> = serde_json::from_str(source)
            .map_err(|e| RecordError::InvalidDescriptor(e.to_string()))?;
        let mut seen = HashSet::new();
        for label in &labels {
            if label.trim().is_empty() {
                return Err(RecordError::InvalidDescriptor("empty label".into()));
            }
            if !seen.insert(label.as_str()) {
                return Err(RecordError::InvalidDescriptor(format!(
                    "duplicate label: {label}"
                )));
            }
        }
        Ok(labels)
    }

    /// Build the record that persists a descriptor.
    pub fn descriptor_record(name: &str, labels: &[String]) -> Lxp {
        Lxp::new()
            .with(DESCRIPTOR_NAME_LABEL, name)
            .with(
                DESCRIPTOR_LABELS_LABEL,
                LxpValue::List(labels.iter().map(|l| LxpValue::Text(l.clone())).collect()),
            )
    }

    /// Rebuild a type label from a persisted descriptor record.
    pub fn from_descriptor_record(record: &Lxp) -> Result<Self, RecordError> {
        let descriptor = record
            .oid()
            .ok_or_else(|| RecordError::InvalidDescriptor("descriptor record has no oid".into()))?;
        let name = record
            .get(DESCRIPTOR_NAME_LABEL)?
            .as_str()
            .ok_or_else(|| RecordError::InvalidDescriptor("type_name is not text".into()))?
            .to_string();
        let labels = record
            .get(DESCRIPTOR_LABELS_LABEL)?
            .as_list()
            .ok_or_else(|| RecordError::InvalidDescriptor("labels is not a list".into()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RecordError::InvalidDescriptor(format!("label {v} is not text")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(name, descriptor, labels))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> Oid {
        self.descriptor
    }

    /// Required labels, in descriptor order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The reference a record stores to point at this type.
    pub fn type_ref(&self) -> TypeRef {
        TypeRef::new(self.name.clone(), self.descriptor)
    }

    /// Create an empty record tagged with this type.
    pub fn new_record(&self) -> Lxp {
        Lxp::typed(self.type_ref())
    }

    /// Labels required by this type that `record` lacks.
    pub fn missing_labels(&self, record: &Lxp) -> Vec<String> {
        self.labels
            .iter()
            .filter(|l| !record.contains_label(l))
            .cloned()
            .collect()
    }

    pub fn is_valid(&self, record: &Lxp) -> bool {
        self.labels.iter().all(|l| record.contains_label(l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> TypeLabel {
        TypeLabel::new("person", Oid::new(2), vec!["age".into(), "address".into()])
    }

    #[test]
    fn parse_rejects_non_array() {
        assert!(TypeLabel::parse_descriptor(r#"{"age": "int"}"#).is_err());
        assert!(TypeLabel::parse_descriptor(r#"["", "x"]"#).is_err());
        assert_eq!(TypeLabel::parse_descriptor("[]").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn validation_is_open_schema() {
        let t = person();
        let mut record = t.new_record().with("age", "42");
        assert!(!t.is_valid(&record));
        assert_eq!(t.missing_labels(&record), vec!["address".to_string()]);

        record.put("address", "home");
        record.put("nickname", "bob");
        assert!(t.is_valid(&record));
        assert!(t.missing_labels(&record).is_empty());
    }

    #[test]
    fn descriptor_record_roundtrip() {
        let mut record = TypeLabel::descriptor_record("person", &["age".into(), "address".into()]);
        assert!(TypeLabel::from_descriptor_record(&record).is_err());

        record.set_oid(Oid::new(2));
        let t = TypeLabel::from_descriptor_record(&record).unwrap();
        assert_eq!(t, person());
        assert_eq!(t.type_ref(), TypeRef::new("person", Oid::new(2)));
    }

    #[test]
    fn descriptor_record_with_wrong_shape() {
        let mut record = Lxp::new().with(DESCRIPTOR_NAME_LABEL, "x").with(DESCRIPTOR_LABELS_LABEL, 3i64);
        record.set_oid(Oid::new(1));
        assert!(matches!(
            TypeLabel::from_descriptor_record(&record),
            Err(RecordError::InvalidDescriptor(_))
        ));
    }
}
