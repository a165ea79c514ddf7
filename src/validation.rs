//! Input validation for tillsync.
//!
//! This module provides validation functions for collection names, record
//! keys and payloads. All validators return TillError::Validation on failure,
//! except unsupported collections which get their own variant.

use crate::error::{TillError, TillResult};
use crate::models::Fields;

// Limits
pub const MAX_COLLECTION_NAME_LENGTH: usize = 64;
pub const MAX_RECORD_KEY_LENGTH: usize = 256;

/// Validate a collection name.
///
/// Collection names become SQLite table name suffixes, so they must be:
/// - Non-empty
/// - No longer than MAX_COLLECTION_NAME_LENGTH characters
/// - ASCII letters, digits and underscore only
/// - Not starting with a digit
pub fn validate_collection_name(name: &str) -> TillResult<()> {
    if name.is_empty() {
        return Err(TillError::validation("collection", "cannot be empty"));
    }

    if name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(TillError::validation(
            "collection",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_COLLECTION_NAME_LENGTH,
                name.len()
            ),
        ));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TillError::validation(
            "collection",
            format!("'{}' may only contain ASCII letters, digits and '_'", name),
        ));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(TillError::validation(
            "collection",
            format!("'{}' cannot start with a digit", name),
        ));
    }

    Ok(())
}

/// Check that a collection is part of the supported set.
pub fn validate_supported_collection(name: &str, supported: &[String]) -> TillResult<()> {
    if supported.iter().any(|c| c == name) {
        Ok(())
    } else {
        Err(TillError::UnsupportedCollection(name.to_string()))
    }
}

/// Validate a record key.
///
/// Keys must be non-empty, bounded in length and free of control characters.
/// `:` is allowed; the outbox key splits on the first colon only.
pub fn validate_record_key(key: &str) -> TillResult<()> {
    if key.trim().is_empty() {
        return Err(TillError::validation(
            "key",
            "cannot be empty or whitespace only",
        ));
    }

    if key.len() > MAX_RECORD_KEY_LENGTH {
        return Err(TillError::validation(
            "key",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_RECORD_KEY_LENGTH,
                key.len()
            ),
        ));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(TillError::validation(
            "key",
            "cannot contain control characters",
        ));
    }

    Ok(())
}

/// Validate a record payload.
///
/// The record key travels next to the fields, never inside them; a `key`
/// field would be ambiguous once a provisional key is remapped.
pub fn validate_fields(fields: &Fields) -> TillResult<()> {
    if fields.contains_key("key") {
        return Err(TillError::validation(
            "fields",
            "'key' is reserved and cannot be used as a field name",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_collection_name_valid() {
        assert!(validate_collection_name("payments").is_ok());
        assert!(validate_collection_name("loyalty_customers").is_ok());
        assert!(validate_collection_name("v2_items").is_ok());
    }

    #[test]
    fn test_validate_collection_name_invalid() {
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("pay-ments").is_err());
        assert!(validate_collection_name("payments; DROP TABLE x").is_err());
        assert!(validate_collection_name("2fast").is_err());
        assert!(validate_collection_name(&"a".repeat(MAX_COLLECTION_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_supported_collection() {
        let supported = vec!["payments".to_string(), "employees".to_string()];
        assert!(validate_supported_collection("payments", &supported).is_ok());
        let err = validate_supported_collection("invoices", &supported).unwrap_err();
        assert!(matches!(err, TillError::UnsupportedCollection(ref c) if c == "invoices"));
    }

    #[test]
    fn test_validate_record_key() {
        assert!(validate_record_key("p1").is_ok());
        assert!(validate_record_key("srv:77").is_ok());
        assert!(validate_record_key("").is_err());
        assert!(validate_record_key("   ").is_err());
        assert!(validate_record_key("a\nb").is_err());
        assert!(validate_record_key(&"k".repeat(MAX_RECORD_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_fields_reserved_key() {
        let ok = json!({"price": 500}).as_object().cloned().unwrap();
        assert!(validate_fields(&ok).is_ok());
        let bad = json!({"key": "p1"}).as_object().cloned().unwrap();
        assert!(validate_fields(&bad).is_err());
    }
}
