//! Conversion between records and plain JSON objects.
//!
//! Used by the HTTP and CLI surfaces, where records are exchanged as
//! `{"label": value, ...}`. References are written `{"$ref": <oid>}`.

use serde_json::{Map, Number, Value};

use crate::error::RecordError;
use crate::oid::Oid;
use crate::record::Lxp;
use crate::value::LxpValue;

const REF_KEY: &str = "$ref";

impl LxpValue {
    /// Convert a JSON value. `label` is only used for error reporting.
    pub fn from_json(label: &str, value: &Value) -> Result<Self, RecordError> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().ok_or_else(|| RecordError::UnsupportedJson {
                    label: label.to_string(),
                    reason: format!("number {n} out of range"),
                })?),
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(items) => Self::List(
                items
                    .iter()
                    .map(|item| Self::from_json(label, item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let oid = match (map.len(), map.get(REF_KEY).and_then(Value::as_u64)) {
                    (1, Some(raw)) if raw != 0 => Oid::new(raw),
                    _ => {
                        return Err(RecordError::UnsupportedJson {
                            label: label.to_string(),
                            reason: "nested objects must be {\"$ref\": <oid>}".into(),
                        })
                    }
                };
                Self::Ref(oid)
            }
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(x) => Number::from_f64(*x).map(Value::Number).unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Ref(oid) => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_string(), Value::Number(oid.as_u64().into()));
                Value::Object(map)
            }
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl Lxp {
    /// Build an untyped record from a JSON object.
    pub fn from_json_object(value: &Value) -> Result<Self, RecordError> {
        let map = value.as_object().ok_or_else(|| RecordError::UnsupportedJson {
            label: String::new(),
            reason: "a record must be a JSON object".into(),
        })?;
        let mut record = Lxp::new();
        for (label, v) in map {
            record.put(label.clone(), LxpValue::from_json(label, v)?);
        }
        Ok(record)
    }

    /// The record's fields as a JSON object.
    pub fn fields_to_json(&self) -> Value {
        let mut map = Map::new();
        for (label, value) in self.iter() {
            map.insert(label.to_string(), value.to_json());
        }
        Value::Object(map)
    }
}
