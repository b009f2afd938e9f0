//! Key and name normalization.
//!
//! Partition keys, row keys, table names and container names all pass through
//! this module before they reach a [`TableService`](crate::TableService).
//! Normalization is lossy: every character outside the permitted alphabet is
//! dropped, so two distinct inputs can collapse onto the same key. Callers
//! pick inputs whose normalized forms stay unique.

use std::{fmt::Display, str::FromStr};

use crate::error::{ConfigError, ConversionError};

/// Maximum length of a table name after normalization.
pub const MAX_TABLE_NAME_LEN: usize = 63;

/// Maximum length of a blob container name after normalization.
pub const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Maps an arbitrary string onto the store key alphabet: lowercase ASCII
/// letters, digits and `-`. Everything else is removed.
///
/// ```
/// use cloudtable_storage::keys::normalize_key;
///
/// assert_eq!(normalize_key("Widget 1/Blue"), "widget1blue");
/// assert_eq!(normalize_key("Widget-1"), "widget-1");
/// ```
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Like [`normalize_key`] but keeps the original letter case.
#[must_use]
pub fn normalize_key_preserving_case(key: &str) -> String {
    key.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect()
}

/// Keeps ASCII letters and digits only. With `lowercase` set, letters are
/// folded to lowercase as well.
#[must_use]
pub fn alphanumeric_key(key: &str, lowercase: bool) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| if lowercase { c.to_ascii_lowercase() } else { c })
        .collect()
}

/// Truncates `value` to at most `max` characters.
#[must_use]
pub fn truncate(mut value: String, max: usize) -> String {
    if let Some((idx, _)) = value.char_indices().nth(max) {
        value.truncate(idx);
    }
    value
}

/// Produces a legal table name: alphanumeric, lowercase, at most
/// [`MAX_TABLE_NAME_LEN`] characters.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidName`] when nothing survives normalization.
pub fn table_name(raw: &str) -> Result<String, ConfigError> {
    let name = truncate(alphanumeric_key(raw, true), MAX_TABLE_NAME_LEN);
    if name.is_empty() {
        return Err(ConfigError::InvalidName { kind: "table", name: raw.to_owned() });
    }
    Ok(name)
}

/// Produces a legal blob container name: the key alphabet with leading and
/// trailing hyphens removed, at most [`MAX_CONTAINER_NAME_LEN`] characters.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidName`] when nothing survives normalization.
pub fn container_name(raw: &str) -> Result<String, ConfigError> {
    let normalized = normalize_key(raw);
    let name = truncate(normalized.trim_matches('-').to_owned(), MAX_CONTAINER_NAME_LEN);
    if name.is_empty() {
        return Err(ConfigError::InvalidName { kind: "container", name: raw.to_owned() });
    }
    Ok(name)
}

/// Conversion between a key field and its string form.
///
/// Key fields leave the entity through [`to_key`](Self::to_key) and are
/// restored from the stored partition or row key through
/// [`from_key`](Self::from_key). Any type with `Display` and `FromStr`
/// qualifies.
pub trait KeyValue: Sized {
    /// Renders the field as a raw (not yet normalized) key.
    fn to_key(&self) -> String;

    /// Parses a stored key back into the field type.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidValue`] when the key does not parse.
    fn from_key(key: &str) -> Result<Self, ConversionError>;
}

impl<T> KeyValue for T
where
    T: Display + FromStr,
    T::Err: Display,
{
    fn to_key(&self) -> String {
        self.to_string()
    }

    fn from_key(key: &str) -> Result<Self, ConversionError> {
        key.parse().map_err(|e: T::Err| {
            ConversionError::invalid_value(format!(
                "cannot parse key {key:?} as {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize_key("Sales"), "sales");
        assert_eq!(normalize_key("Widget-1"), "widget-1");
        assert_eq!(normalize_key("a_b.c d/é"), "abcd");
        assert_eq!(normalize_key(""), "");
    }

    #[test]
    fn test_preserving_case_keeps_hyphen() {
        assert_eq!(normalize_key_preserving_case("Widget-1 (Blue)"), "Widget-1Blue");
    }

    #[test]
    fn test_alphanumeric_drops_hyphen() {
        assert_eq!(alphanumeric_key("Order-Lines_2024", false), "OrderLines2024");
        assert_eq!(alphanumeric_key("Order-Lines_2024", true), "orderlines2024");
    }

    #[test]
    fn test_table_name_truncates_to_limit() {
        let raw = "x".repeat(100);
        assert_eq!(table_name(&raw).unwrap().len(), MAX_TABLE_NAME_LEN);
    }

    #[test]
    fn test_table_name_rejects_empty_result() {
        assert!(matches!(table_name("--__"), Err(ConfigError::InvalidName { kind: "table", .. })));
    }

    #[test]
    fn test_container_name_trims_hyphens() {
        assert_eq!(container_name("-Uploads-").unwrap(), "uploads");
        assert_eq!(container_name("dev-Uploads").unwrap(), "dev-uploads");
    }

    #[test]
    fn test_key_value_round_trip_for_uuid() {
        let id = Uuid::new_v4();
        let key = id.to_key();
        assert_eq!(Uuid::from_key(&key).unwrap(), id);
    }

    #[test]
    fn test_key_value_parse_failure_is_invalid_value() {
        let err = i32::from_key("forty-two").unwrap_err();
        assert!(matches!(err, ConversionError::InvalidValue { .. }));
    }

    proptest! {
        /// Output never leaves the lowercase key alphabet.
        #[test]
        fn normalize_output_alphabet(input in ".*") {
            let key = normalize_key(&input);
            let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
            prop_assert!(key.chars().all(allowed));
        }

        /// Normalizing twice is the same as normalizing once.
        #[test]
        fn normalize_is_idempotent(input in ".*") {
            let once = normalize_key(&input);
            prop_assert_eq!(normalize_key(&once), once);
        }

        /// Table names are always within the length ceiling.
        #[test]
        fn table_name_within_limit(input in "[a-zA-Z0-9]{1,200}") {
            let name = table_name(&input).expect("alphanumeric input is never empty");
            prop_assert!(name.len() <= MAX_TABLE_NAME_LEN);
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }
}
