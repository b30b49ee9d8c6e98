//! Routing rules - maps an event to a storage profile name.
//!
//! Rules are grouped into four tiers which are evaluated in a fixed order.
//! The first tier with a match decides; declaration order only matters
//! between rules of the same tier.
//!
//! # Matching Priority
//!
//! 1. Category overrides (`dlq.*`, `audit.*`)
//! 2. Category domain rules (`facebook.*`, `business.*`, ...)
//! 3. Kind + level table, with a per-kind `*` entry for unlisted levels
//! 4. Fallback profile
//!
//! # Pattern Matching
//!
//! ```text
//! Pattern         | Matches
//! ----------------|-------------------------------------
//! audit.login     | audit.login, AUDIT.LOGIN (exact, any case)
//! dlq.*           | dlq.retry, dlq.parse.error
//! *.charge        | payments.charge
//! *               | everything
//! ```
//!
//! # Architecture
//!
//! ```text
//! Event (kind: SYSTEM, level: ERROR, category: "payments.charge")
//!     │
//!     ▼
//! ┌─────────────────────────────────────────┐
//! │            ROUTING RULES                │
//! │                                         │
//! │  1. Override "dlq.*"?          NO       │
//! │  2. Category "business.*"?     NO       │
//! │  3. byKindAndLevel[SYSTEM][ERROR]  YES  │
//! │  => CRITICAL_DUAL                       │
//! └─────────────────────────────────────────┘
//! ```

use crate::event::{Kind, Level, LogEvent};
use crate::profile::ProfileRegistry;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

/// Errors raised while building or validating routing rules.
///
/// These are the only fatal configuration errors: the worker refuses to
/// start when any of them occurs.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routing rules reference unknown profiles: {}", .0.join(", "))]
    UnknownProfiles(Vec<String>),

    #[error("invalid category pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown kind '{0}' in routing table")]
    UnknownKind(String),

    #[error("unknown level '{level}' for kind {kind} in routing table")]
    UnknownLevel { kind: Kind, level: String },
}

/// Which tier produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Override,
    Category,
    KindLevel,
    Fallback,
}

/// Result of resolving an event against the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub profile: &'a str,
    pub tier: Tier,
}

/// A glob over category names, compiled to an anchored case-insensitive regex.
#[derive(Debug, Clone)]
pub struct CategoryPattern {
    pattern: String,
    regex: Regex,
}

impl CategoryPattern {
    pub fn new(pattern: &str) -> Result<Self, RoutingError> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = RegexBuilder::new(&format!("^{}$", body))
            .case_insensitive(true)
            .build()
            .map_err(|e| RoutingError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, category: &str) -> bool {
        self.regex.is_match(category)
    }
}

/// A category predicate and the profile it selects.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub pattern: CategoryPattern,
    pub profile: String,
}

impl CategoryRule {
    pub fn new(pattern: &str, profile: impl Into<String>) -> Result<Self, RoutingError> {
        Ok(Self {
            pattern: CategoryPattern::new(pattern)?,
            profile: profile.into(),
        })
    }
}

/// Per-kind level table.
#[derive(Debug, Clone, Default)]
pub struct LevelTable {
    levels: HashMap<Level, String>,
    any: Option<String>,
}

impl LevelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: Level, profile: impl Into<String>) -> Self {
        self.levels.insert(level, profile.into());
        self
    }

    /// Profile for levels not listed explicitly.
    pub fn any(mut self, profile: impl Into<String>) -> Self {
        self.any = Some(profile.into());
        self
    }

    fn lookup(&self, level: Level) -> Option<&str> {
        self.levels
            .get(&level)
            .or(self.any.as_ref())
            .map(String::as_str)
    }

    fn profiles(&self) -> impl Iterator<Item = &str> {
        self.levels.values().chain(self.any.iter()).map(String::as_str)
    }
}

/// The compiled rule tiers.
///
/// Resolution is pure: the same event always yields the same profile.
#[derive(Debug, Clone)]
pub struct RoutingRules {
    overrides: Vec<CategoryRule>,
    by_category: Vec<CategoryRule>,
    by_kind_and_level: HashMap<Kind, LevelTable>,
    fallback: String,
}

impl RoutingRules {
    /// Create an empty rule set that routes everything to `fallback`.
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            overrides: Vec::new(),
            by_category: Vec::new(),
            by_kind_and_level: HashMap::new(),
            fallback: fallback.into(),
        }
    }

    pub fn with_override(mut self, rule: CategoryRule) -> Self {
        self.overrides.push(rule);
        self
    }

    pub fn with_category(mut self, rule: CategoryRule) -> Self {
        self.by_category.push(rule);
        self
    }

    pub fn with_kind(mut self, kind: Kind, table: LevelTable) -> Self {
        self.by_kind_and_level.insert(kind, table);
        self
    }

    /// The built-in rules matching the built-in profile table.
    pub fn builtin() -> Self {
        let rule = |pattern: &str, profile: &str| {
            CategoryRule::new(pattern, profile).expect("built-in pattern is valid")
        };
        let severity_table = |error: &str, warn: &str, info: &str| {
            LevelTable::new()
                .level(Level::Fatal, "CRITICAL_DUAL")
                .level(Level::Error, error)
                .level(Level::Warn, warn)
                .level(Level::Info, info)
                .level(Level::Debug, "DEBUG_SHORT")
                .level(Level::Trace, "DEBUG_SHORT")
        };

        Self::new("HOT_SEARCH")
            .with_override(rule("dlq.*", "DLQ"))
            .with_override(rule("audit.*", "AUDIT"))
            .with_category(rule("facebook.*", "HOT_SEARCH"))
            .with_category(rule("flickr.*", "HOT_SEARCH"))
            .with_category(rule("stealthflow.*", "HOT_SEARCH"))
            .with_category(rule("business.*", "LONG_TERM"))
            .with_category(rule("analytics.*", "LONG_TERM"))
            .with_kind(
                Kind::Business,
                severity_table("CRITICAL_DUAL", "CRITICAL_DUAL", "LONG_TERM"),
            )
            .with_kind(
                Kind::System,
                severity_table("CRITICAL_DUAL", "HOT_SEARCH", "HOT_SEARCH"),
            )
            .with_kind(Kind::Analytics, LevelTable::new().any("LONG_TERM"))
            .with_kind(Kind::Audit, LevelTable::new().any("AUDIT"))
            .with_kind(
                Kind::Security,
                severity_table("CRITICAL_DUAL", "CRITICAL_DUAL", "HOT_SEARCH"),
            )
    }

    /// Compile the `[routing]` section of the config file.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, RoutingError> {
        let mut rules = Self::new(&config.fallback_profile);

        for raw in &config.overrides {
            rules.overrides.push(CategoryRule::new(&raw.category, &raw.profile)?);
        }
        for raw in &config.by_category {
            rules.by_category.push(CategoryRule::new(&raw.pattern, &raw.profile)?);
        }
        for (kind_name, levels) in &config.by_kind_and_level {
            let kind: Kind = kind_name
                .parse()
                .map_err(|_| RoutingError::UnknownKind(kind_name.clone()))?;

            let mut table = LevelTable::new();
            for (level_name, profile) in levels {
                if level_name == "*" {
                    table = table.any(profile);
                } else {
                    let level = level_name.parse().map_err(|_| RoutingError::UnknownLevel {
                        kind,
                        level: level_name.clone(),
                    })?;
                    table = table.level(level, profile);
                }
            }
            rules.by_kind_and_level.insert(kind, table);
        }

        Ok(rules)
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Resolve the storage profile for an event. Never fails.
    pub fn resolve(&self, event: &LogEvent) -> Resolution<'_> {
        let category = event.category.as_deref().filter(|c| !c.is_empty());

        if let Some(category) = category {
            if let Some(rule) = first_match(&self.overrides, category) {
                return Resolution {
                    profile: &rule.profile,
                    tier: Tier::Override,
                };
            }
            if let Some(rule) = first_match(&self.by_category, category) {
                return Resolution {
                    profile: &rule.profile,
                    tier: Tier::Category,
                };
            }
        }

        if let (Some(kind), Some(level)) = (event.kind, event.level) {
            if let Some(profile) = self
                .by_kind_and_level
                .get(&kind)
                .and_then(|table| table.lookup(level))
            {
                return Resolution {
                    profile,
                    tier: Tier::KindLevel,
                };
            }
        }

        debug!(
            category = ?event.category,
            kind = ?event.kind,
            level = ?event.level,
            "No routing rule matched, using fallback profile"
        );

        Resolution {
            profile: &self.fallback,
            tier: Tier::Fallback,
        }
    }

    /// Shorthand for [`resolve`](Self::resolve) returning only the profile name.
    pub fn resolve_profile(&self, event: &LogEvent) -> &str {
        self.resolve(event).profile
    }

    /// Every profile name referenced by any tier.
    pub fn referenced_profiles(&self) -> BTreeSet<&str> {
        self.overrides
            .iter()
            .chain(&self.by_category)
            .map(|rule| rule.profile.as_str())
            .chain(self.by_kind_and_level.values().flat_map(LevelTable::profiles))
            .chain(std::iter::once(self.fallback.as_str()))
            .collect()
    }

    /// Check that every referenced profile exists in the registry.
    pub fn validate(&self, profiles: &ProfileRegistry) -> Result<(), RoutingError> {
        let missing: Vec<String> = self
            .referenced_profiles()
            .into_iter()
            .filter(|name| !profiles.contains(name))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RoutingError::UnknownProfiles(missing))
        }
    }
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self::builtin()
    }
}

fn first_match<'a>(rules: &'a [CategoryRule], category: &str) -> Option<&'a CategoryRule> {
    rules.iter().find(|rule| rule.pattern.matches(category))
}

/// `[routing]` section of the config file.
///
/// ```toml
/// [routing]
/// fallback_profile = "HOT_SEARCH"
/// overrides = [{ category = "dlq.*", profile = "DLQ" }]
/// by_category = [{ pattern = "business.*", profile = "LONG_TERM" }]
///
/// [routing.by_kind_and_level.ANALYTICS]
/// "*" = "LONG_TERM"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub overrides: Vec<OverrideConfig>,

    #[serde(default)]
    pub by_category: Vec<PatternConfig>,

    #[serde(default)]
    pub by_kind_and_level: BTreeMap<String, BTreeMap<String, String>>,

    pub fallback_profile: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideConfig {
    pub category: String,
    pub profile: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternConfig {
    pub pattern: String,
    pub profile: String,
}
