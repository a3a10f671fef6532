//! Message catalog — opaque key→text lookup for canned message bodies.
//!
//! Loaded once at startup from a JSON object file and immutable for the
//! process lifetime. The catalog holds no logic; everything that decides
//! *which* key to send lives in the router and the campaign definitions.

use std::collections::HashMap;
use std::path::Path;

use crate::error::CatalogError;

/// Reply sent when no routing rule matches. Not a catalog entry: the
/// fallback must exist even if the catalog file is missing a key.
pub const FALLBACK_TEXT: &str = "🙏 โปรดทำตามคำแนะนำ / Please follow the instructions.";

/// Keys the funnel references. Validated up front so a typo in the catalog
/// file fails at startup instead of at 3am when a drip message fires.
pub const REQUIRED_KEYS: &[&str] = &[
    "greeting",
    "gift",
    "activated",
    "rose_path",
    "day1_reminder",
    "day2_invite",
    "day2_blessing",
    "day3_teaser",
];

/// Immutable key→text store for message bodies.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    messages: HashMap<String, String>,
}

impl MessageCatalog {
    /// Load the catalog from a JSON object file and validate required keys.
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let messages: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|e| CatalogError::BadFormat(e.to_string()))?;
        let catalog = Self { messages };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Build a catalog from a literal map (tests).
    pub fn from_map(messages: HashMap<String, String>) -> Self {
        Self { messages }
    }

    /// Look up the body for a message key.
    pub fn lookup(&self, key: &str) -> Result<&str, CatalogError> {
        self.messages
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CatalogError::UnknownKey {
                key: key.to_string(),
            })
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for key in REQUIRED_KEYS {
            if !self.messages.contains_key(*key) {
                return Err(CatalogError::MissingRequired {
                    key: (*key).to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A catalog with all required keys, each mapping to "<key> text".
    fn test_catalog() -> MessageCatalog {
        let messages = REQUIRED_KEYS
            .iter()
            .map(|k| (k.to_string(), format!("{k} text")))
            .collect();
        MessageCatalog::from_map(messages)
    }

    #[test]
    fn lookup_hit() {
        let catalog = test_catalog();
        assert_eq!(catalog.lookup("greeting").unwrap(), "greeting text");
    }

    #[test]
    fn lookup_miss() {
        let catalog = test_catalog();
        let err = catalog.lookup("nope").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownKey { .. }));
    }

    #[test]
    fn validate_rejects_incomplete_catalog() {
        let mut messages: HashMap<String, String> = REQUIRED_KEYS
            .iter()
            .map(|k| (k.to_string(), String::new()))
            .collect();
        messages.remove("day3_teaser");
        let catalog = MessageCatalog::from_map(messages);
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::MissingRequired { .. })
        ));
    }
}
