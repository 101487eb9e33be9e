//! Sanitized key/value metadata attached to transactions.
//!
//! Metadata is free-form caller input, so it is validated before it is ever
//! persisted: the map is size-capped, credential-like keys are rejected and
//! script-like content is stripped from values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum number of entries in a metadata map.
pub const MAX_METADATA_ENTRIES: usize = 50;

/// Maximum length of a metadata key, in characters.
pub const MAX_KEY_LENGTH: usize = 40;

/// Maximum length of a metadata value, in characters (after sanitizing).
pub const MAX_VALUE_LENGTH: usize = 500;

/// Key fragments that must never be stored.
const RESTRICTED_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "private_key",
    "authorization",
    "card_number",
    "cardnumber",
    "cvv",
    "cvc",
    "ssn",
];

/// Value fragments that are removed (compared case-insensitively).
const SCRIPT_FRAGMENTS: &[&str] = &["javascript:", "vbscript:", "data:text/html"];

/// Errors produced while sanitizing metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// Too many entries.
    #[error("metadata has {count} entries, maximum is {MAX_METADATA_ENTRIES}")]
    TooManyEntries {
        /// Number of entries supplied.
        count: usize,
    },

    /// A key is empty, too long or contains unsupported characters.
    #[error("invalid metadata key: {0}")]
    InvalidKey(String),

    /// A key looks like it carries a credential.
    #[error("restricted metadata key: {0}")]
    RestrictedKey(String),

    /// A value is too long.
    #[error("metadata value for {key} exceeds {MAX_VALUE_LENGTH} characters")]
    ValueTooLong {
        /// Key whose value was too long.
        key: String,
    },
}

/// Opaque, sanitized metadata map.
///
/// The only way to build one from untrusted input is [`Metadata::sanitize`];
/// [`Metadata::insert_system`] is for keys the engine itself writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and sanitize untrusted key/value pairs.
    ///
    /// # Errors
    ///
    /// Returns a [`MetadataError`] when the map is too large, a key is invalid
    /// or restricted, or a value is too long after stripping.
    pub fn sanitize<I, K, V>(entries: I) -> Result<Self, MetadataError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            let key = validate_key(key.into())?;
            let value = strip_script_content(&value.into());
            if value.chars().count() > MAX_VALUE_LENGTH {
                return Err(MetadataError::ValueTooLong { key });
            }
            map.insert(key, value);
        }
        if map.len() > MAX_METADATA_ENTRIES {
            return Err(MetadataError::TooManyEntries { count: map.len() });
        }
        Ok(Self(map))
    }

    /// Insert an engine-owned entry, bypassing the caller-facing checks.
    pub fn insert_system(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` is present with the value `"true"`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn validate_key(key: String) -> Result<String, MetadataError> {
    let trimmed = key.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_KEY_LENGTH {
        return Err(MetadataError::InvalidKey(key));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(MetadataError::InvalidKey(key));
    }
    let lowered = trimmed.to_ascii_lowercase();
    if RESTRICTED_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
    {
        return Err(MetadataError::RestrictedKey(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Remove markup brackets, control characters and script URL schemes.
fn strip_script_content(value: &str) -> String {
    let mut cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '<' | '>') && !c.is_control())
        .collect();

    for fragment in SCRIPT_FRAGMENTS {
        loop {
            let lowered = cleaned.to_ascii_lowercase();
            let Some(start) = lowered.find(fragment) else {
                break;
            };
            cleaned.replace_range(start..start + fragment.len(), "");
        }
    }

    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_ordinary_entries() {
        let metadata = Metadata::sanitize([("job_id", "J-42"), ("source", "mobile")]).unwrap();
        assert_eq!(metadata.get("job_id"), Some("J-42"));
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn rejects_credential_keys() {
        let err = Metadata::sanitize([("stripe_api_key", "sk_live_x")]).unwrap_err();
        assert_eq!(err, MetadataError::RestrictedKey("stripe_api_key".into()));

        let err = Metadata::sanitize([("CardNumber", "4242")]).unwrap_err();
        assert!(matches!(err, MetadataError::RestrictedKey(_)));
    }

    #[test]
    fn strips_script_content() {
        let metadata = Metadata::sanitize([(
            "note",
            "<script>alert(1)</script> JavaScript:evil() ok",
        )])
        .unwrap();
        assert_eq!(metadata.get("note"), Some("scriptalert(1)/script evil() ok"));
    }

    #[test]
    fn enforces_size_caps() {
        let too_many = (0..=MAX_METADATA_ENTRIES).map(|i| (format!("k{i}"), "v".to_string()));
        assert!(matches!(
            Metadata::sanitize(too_many),
            Err(MetadataError::TooManyEntries { .. })
        ));

        let long_value = "x".repeat(MAX_VALUE_LENGTH + 1);
        assert!(matches!(
            Metadata::sanitize([("note", long_value)]),
            Err(MetadataError::ValueTooLong { .. })
        ));

        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(
            Metadata::sanitize([(long_key, "v")]),
            Err(MetadataError::InvalidKey(_))
        ));
    }

    #[test]
    fn system_entries_bypass_checks() {
        let mut metadata = Metadata::new();
        metadata.insert_system("auto_topup", "true");
        assert!(metadata.flag("auto_topup"));
        assert!(!metadata.flag("missing"));
    }
}
