use std::fmt;

use serde::{Deserialize, Serialize};

use crate::oid::Oid;

/// A value stored under a label in an [`Lxp`](crate::Lxp) record.
///
/// Records never embed other records. A nested record is stored in its own
/// bucket and referenced by OID through [`LxpValue::Ref`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LxpValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Reference to another persisted record.
    Ref(Oid),
    List(Vec<LxpValue>),
}

impl LxpValue {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Ref(_) => "ref",
            Self::List(_) => "list",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ref_oid(&self) -> Option<Oid> {
        match self {
            Self::Ref(oid) => Some(*oid),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[LxpValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for LxpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Ref(oid) => write!(f, "@{oid}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for LxpValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for LxpValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for LxpValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for LxpValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for LxpValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Oid> for LxpValue {
    fn from(oid: Oid) -> Self {
        Self::Ref(oid)
    }
}

impl<T: Into<LxpValue>> From<Vec<T>> for LxpValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(LxpValue::from("x"), LxpValue::Text("x".into()));
        assert_eq!(LxpValue::from(3i64).as_i64(), Some(3));
        assert_eq!(LxpValue::from(Oid::new(9)).as_ref_oid(), Some(Oid::new(9)));
        assert_eq!(
            LxpValue::from(vec!["a", "b"]).as_list().map(|l| l.len()),
            Some(2)
        );
    }

    #[test]
    fn display_nested() {
        let v = LxpValue::List(vec![LxpValue::Int(1), LxpValue::Ref(Oid::new(4))]);
        assert_eq!(v.to_string(), "[1, @4]");
    }
}
