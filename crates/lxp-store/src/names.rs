//! Repository and bucket name validation.
//!
//! Names become directory names, so a valid name:
//! - is non-empty and at most 128 bytes
//! - contains no path separators, whitespace, or control characters
//! - does not start with `.` (hidden/traversal) or `_` (reserved)

use crate::error::{StoreError, StoreResult};

const MAX_NAME_LEN: usize = 128;

/// Characters that are forbidden anywhere in a name.
const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a repository or bucket name.
///
/// ```
/// use lxp_store::names::validate_name;
///
/// assert!(validate_name("people").is_ok());
/// assert!(validate_name("census-1881").is_ok());
/// assert!(validate_name("").is_err());
/// assert!(validate_name("../etc").is_err());
/// ```
pub fn validate_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 128 bytes"));
    }
    if let Some(ch) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(invalid(&format!("contains forbidden character: {ch:?}")));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("must not contain whitespace or control characters"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if name.starts_with('_') {
        return Err(invalid("names starting with '_' are reserved"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["repo", "b", "census_1881", "a.b", "UPPER"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_path_like_names() {
        for name in ["a/b", "a\\b", "..", ".hidden", "_txlog", "a b", "tab\t", "x:y"] {
            assert!(validate_name(name).is_err(), "{name:?} should be invalid");
        }
    }

    #[test]
    fn rejects_long_names() {
        let name = "x".repeat(129);
        let err = validate_name(&name).unwrap_err();
        assert!(matches!(err, StoreError::InvalidName { .. }));
        assert!(validate_name(&"x".repeat(128)).is_ok());
    }
}
