// src/config.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::model::CategoryName;
use crate::rules::{CategoryPattern, CategoryRule};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment configuration error: {0}")]
    Env(#[from] envy::Error),
    #[error("Unknown category pattern: {0}")]
    UnknownPattern(String),
}

/// Scan behaviour toggles.
///
/// Categories matching `excluded_patterns` or `excluded_categories` are left
/// out of the scan entirely. The compensatory-rest pattern is excluded by
/// default because the engine has no chain semantics for it; which named
/// categories to exclude is left to the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub excluded_patterns: BTreeSet<CategoryPattern>,
    pub excluded_categories: BTreeSet<CategoryName>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            excluded_patterns: BTreeSet::from([CategoryPattern::CompensatoryRest]),
            excluded_categories: BTreeSet::new(),
        }
    }
}

impl ScanConfig {
    /// Scan everything, including patterns excluded by default.
    pub fn scan_all() -> Self {
        Self {
            excluded_patterns: BTreeSet::new(),
            excluded_categories: BTreeSet::new(),
        }
    }

    pub fn is_excluded(&self, rule: &CategoryRule) -> bool {
        self.excluded_patterns.contains(&rule.pattern)
            || self.excluded_categories.contains(&rule.name)
    }

    /// Reads `ABSENCE_EXCLUDED_PATTERNS` and `ABSENCE_EXCLUDED_CATEGORIES`
    /// (comma separated). Unset variables keep the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        EnvConfig::load()?.into_scan_config()
    }
}

/// Raw environment shape, also carries settings only the binary uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvConfig {
    pub excluded_patterns: Option<Vec<String>>,
    pub excluded_categories: Option<Vec<String>>,
    pub log_filter: Option<String>,
}

impl EnvConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Ok(envy::prefixed("ABSENCE_").from_env::<EnvConfig>()?)
    }

    pub fn into_scan_config(self) -> Result<ScanConfig, ConfigError> {
        let mut config = ScanConfig::default();
        if let Some(patterns) = self.excluded_patterns {
            config.excluded_patterns = patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.parse::<CategoryPattern>())
                .collect::<Result<_, _>>()?;
        }
        if let Some(categories) = self.excluded_categories {
            config.excluded_categories = categories
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_excludes_only_compensatory_rest() {
        let config = ScanConfig::default();
        assert!(config
            .excluded_patterns
            .contains(&CategoryPattern::CompensatoryRest));
        assert_eq!(config.excluded_patterns.len(), 1);
        assert!(config.excluded_categories.is_empty());
    }

    #[test]
    fn env_values_override_defaults() {
        let env = EnvConfig {
            excluded_patterns: Some(vec!["vacations".into(), " ".into()]),
            excluded_categories: Some(vec![" legacy_permits ".into()]),
            log_filter: None,
        };
        let config = env.into_scan_config().expect("valid config");
        assert_eq!(
            config.excluded_patterns,
            BTreeSet::from([CategoryPattern::Vacations])
        );
        assert!(config.excluded_categories.contains("legacy_permits"));
    }

    #[test]
    fn unknown_pattern_is_rejected() {
        let env = EnvConfig {
            excluded_patterns: Some(vec!["overtime".into()]),
            ..Default::default()
        };
        assert!(matches!(
            env.into_scan_config(),
            Err(ConfigError::UnknownPattern(p)) if p == "overtime"
        ));
    }
}
