//! Storage profiles: where an event is stored and for how long.
//!
//! A profile names one or more [`Destination`]s plus the naming policy for
//! each of them. Routing rules only ever refer to profiles by name; this is
//! the single place that knows about search indices and collections.
//!
//! ```text
//! Profile        | Destinations              | Retention | Naming
//! ---------------|---------------------------|-----------|---------------------------
//! HOT_SEARCH     | search_index              | 30d       | logs-hot-YYYY.MM.DD
//! LONG_TERM      | document_store            | 365d      | logs_long_term
//! AUDIT          | document_store            | 3650d     | logs_audit
//! DEBUG_SHORT    | search_index              | 7d        | logs-debug-YYYY.MM.DD
//! CRITICAL_DUAL  | search_index + documents  | 90d       | logs-critical-* / logs_critical
//! DLQ            | document_store            | 90d       | logs_dlq
//! ```

use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Collection used when a document-store profile does not name one.
pub const DEFAULT_COLLECTION: &str = "logs_default";

/// Storage backend kind a profile can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum Destination {
    #[serde(rename = "search_index", alias = "elasticsearch")]
    SearchIndex,
    #[serde(rename = "document_store", alias = "mongodb")]
    DocumentStore,
}

/// A named storage policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageProfile {
    #[serde(skip)]
    pub name: String,

    pub destinations: Vec<Destination>,

    #[serde(default)]
    pub retention_days: u32,

    /// Prefix of the daily search index (`<prefix>-YYYY.MM.DD`)
    #[serde(default)]
    pub index_prefix: Option<String>,

    /// Document store collection
    #[serde(default)]
    pub collection: Option<String>,
}

impl StorageProfile {
    pub fn new(name: impl Into<String>, destinations: &[Destination], retention_days: u32) -> Self {
        Self {
            name: name.into(),
            destinations: destinations.to_vec(),
            retention_days,
            index_prefix: None,
            collection: None,
        }
    }

    pub fn with_index_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.index_prefix = Some(prefix.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn writes_to(&self, destination: Destination) -> bool {
        self.destinations.contains(&destination)
    }

    /// Search index for events processed on `date`.
    ///
    /// Profiles without a prefix share the configured default alias.
    pub fn index_name(&self, default_alias: &str, date: NaiveDate) -> String {
        match &self.index_prefix {
            Some(prefix) => format!("{}-{}", prefix, date.format("%Y.%m.%d")),
            None => default_alias.to_string(),
        }
    }

    /// Document store collection for this profile.
    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or(DEFAULT_COLLECTION)
    }
}

/// Errors in the profile table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile '{0}' has no destinations")]
    NoDestinations(String),

    #[error("profile table is empty")]
    Empty,
}

/// Read-only table of storage profiles, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, StorageProfile>,
}

impl ProfileRegistry {
    /// Build a registry from a list of profiles.
    pub fn new(profiles: impl IntoIterator<Item = StorageProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
        }
    }

    /// Build a registry from the `[profiles.*]` tables of the config file.
    pub fn from_config(profiles: &BTreeMap<String, StorageProfile>) -> Self {
        Self::new(profiles.iter().map(|(name, profile)| StorageProfile {
            name: name.clone(),
            ..profile.clone()
        }))
    }

    /// The built-in profile table.
    pub fn builtin() -> Self {
        use Destination::*;

        Self::new([
            StorageProfile::new("HOT_SEARCH", &[SearchIndex], 30).with_index_prefix("logs-hot"),
            StorageProfile::new("LONG_TERM", &[DocumentStore], 365)
                .with_collection("logs_long_term"),
            StorageProfile::new("AUDIT", &[DocumentStore], 3650).with_collection("logs_audit"),
            StorageProfile::new("DEBUG_SHORT", &[SearchIndex], 7).with_index_prefix("logs-debug"),
            StorageProfile::new("CRITICAL_DUAL", &[SearchIndex, DocumentStore], 90)
                .with_index_prefix("logs-critical")
                .with_collection("logs_critical"),
            StorageProfile::new("DLQ", &[DocumentStore], 90).with_collection("logs_dlq"),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&StorageProfile> {
        self.profiles.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Check that every profile declares at least one destination.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.profiles.is_empty() {
            return Err(ProfileError::Empty);
        }
        match self.profiles.values().find(|p| p.destinations.is_empty()) {
            Some(profile) => Err(ProfileError::NoDestinations(profile.name.clone())),
            None => Ok(()),
        }
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 2).unwrap()
    }

    #[test]
    fn test_builtin_profiles() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.len(), 6);
        assert!(registry.validate().is_ok());

        let critical = registry.get("CRITICAL_DUAL").unwrap();
        assert!(critical.writes_to(Destination::SearchIndex));
        assert!(critical.writes_to(Destination::DocumentStore));
        assert_eq!(critical.collection_name(), "logs_critical");
    }

    #[test]
    fn test_index_name() {
        let registry = ProfileRegistry::builtin();
        let hot = registry.get("HOT_SEARCH").unwrap();
        assert_eq!(hot.index_name("logs", date()), "logs-hot-2025.12.02");

        let bare = StorageProfile::new("BARE", &[Destination::SearchIndex], 1);
        assert_eq!(bare.index_name("logs-default", date()), "logs-default");
        assert_eq!(bare.collection_name(), DEFAULT_COLLECTION);
    }

    #[test]
    fn test_validate_rejects_empty_destinations() {
        let registry = ProfileRegistry::new([StorageProfile::new("NOWHERE", &[], 1)]);
        assert_eq!(
            registry.validate(),
            Err(ProfileError::NoDestinations("NOWHERE".to_string()))
        );
        assert_eq!(ProfileRegistry::new([]).validate(), Err(ProfileError::Empty));
    }

    #[test]
    fn test_parse_profiles_from_toml() {
        let toml = r#"
            [HOT]
            destinations = ["elasticsearch"]
            retention_days = 14
            index_prefix = "hot"

            [ARCHIVE]
            destinations = ["document_store", "search_index"]
            collection = "archive"
        "#;

        let raw: BTreeMap<String, StorageProfile> = toml::from_str(toml).unwrap();
        let registry = ProfileRegistry::from_config(&raw);

        let hot = registry.get("HOT").unwrap();
        assert_eq!(hot.name, "HOT");
        assert_eq!(hot.destinations, vec![Destination::SearchIndex]);
        assert_eq!(hot.retention_days, 14);

        let archive = registry.get("ARCHIVE").unwrap();
        assert!(archive.writes_to(Destination::DocumentStore));
        assert_eq!(archive.collection_name(), "archive");
    }
}
