use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Store-wide unique object identifier.
///
/// OIDs are allocated by the store from a strictly increasing counter and
/// are never reused, not even after the record they named is deleted. Zero
/// is never allocated and is treated as "no object".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(u64);

impl Oid {
    /// Wrap a raw counter value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The null OID. Never returned by allocation.
    pub const fn null() -> Self {
        Self(0)
    }

    /// Returns `true` if this is the null OID.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// File name used by directory-backed buckets.
    pub fn file_name(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Oid {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u64 = s
            .trim()
            .parse()
            .map_err(|_| RecordError::InvalidOid(s.to_string()))?;
        if raw == 0 {
            return Err(RecordError::InvalidOid(s.to_string()));
        }
        Ok(Self(raw))
    }
}

impl From<u64> for Oid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Oid> for u64 {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_is_zero() {
        assert!(Oid::null().is_null());
        assert!(!Oid::new(1).is_null());
    }

    #[test]
    fn parse_rejects_zero_and_garbage() {
        assert!("0".parse::<Oid>().is_err());
        assert!("abc".parse::<Oid>().is_err());
        assert!("-4".parse::<Oid>().is_err());
        assert_eq!("42".parse::<Oid>().unwrap(), Oid::new(42));
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Oid::new(7)).unwrap();
        assert_eq!(json, "7");
    }

    proptest! {
        #[test]
        fn file_name_parses_back(raw in 1u64..u64::MAX) {
            let oid = Oid::new(raw);
            prop_assert_eq!(oid.file_name().parse::<Oid>().unwrap(), oid);
        }

        #[test]
        fn ordering_follows_counter(a in 1u64..1_000_000, b in 1u64..1_000_000) {
            prop_assert_eq!(Oid::new(a) < Oid::new(b), a < b);
        }
    }
}
