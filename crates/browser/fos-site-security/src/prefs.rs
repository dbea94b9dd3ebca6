//! Site Security Preferences
//!
//! Runtime switches consulted on every call. Values live in atomics behind
//! an `Arc`, so a change made through one handle is seen by the next
//! operation on any service sharing it.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Default cap on header-supplied HPKP max-age (60 days)
pub const DEFAULT_HPKP_MAX_MAX_AGE_SECONDS: u64 = 60 * 24 * 60 * 60;

pub const ENV_ENFORCEMENT_LEVEL: &str = "FOS_CERT_PINNING_ENFORCEMENT_LEVEL";
pub const ENV_NON_BUILTIN_ROOTS: &str = "FOS_CERT_PINNING_PROCESS_HEADERS_FROM_NON_BUILTIN_ROOTS";
pub const ENV_MAX_MAX_AGE: &str = "FOS_CERT_PINNING_MAX_MAX_AGE_SECONDS";

/// Certificate pinning enforcement tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementLevel {
    /// Pinning disabled
    Off = 0,
    /// Pins are not enforced for chains rooted at user-added anchors
    AllowUserMitm = 1,
    /// Pins always enforced
    #[default]
    Strict = 2,
    /// Strict, plus test-mode preload entries
    EnforceTestMode = 3,
}

impl EnforcementLevel {
    /// Map an integer tier; unknown values fall back to `Strict`
    pub fn from_int(level: i64) -> Self {
        match level {
            0 => Self::Off,
            1 => Self::AllowUserMitm,
            2 => Self::Strict,
            3 => Self::EnforceTestMode,
            other => {
                tracing::debug!(level = other, "unknown enforcement level, using strict");
                Self::Strict
            }
        }
    }

    pub fn as_int(&self) -> u8 {
        *self as u8
    }
}

/// Shared preference block
#[derive(Debug)]
pub struct SitePrefs {
    enforcement_level: AtomicU8,
    process_headers_from_non_builtin_roots: AtomicBool,
    hpkp_max_max_age_seconds: AtomicU64,
    hsts_enabled: AtomicBool,
    hpkp_enabled: AtomicBool,
}

impl Default for SitePrefs {
    fn default() -> Self {
        Self {
            enforcement_level: AtomicU8::new(EnforcementLevel::default().as_int()),
            process_headers_from_non_builtin_roots: AtomicBool::new(false),
            hpkp_max_max_age_seconds: AtomicU64::new(DEFAULT_HPKP_MAX_MAX_AGE_SECONDS),
            hsts_enabled: AtomicBool::new(true),
            hpkp_enabled: AtomicBool::new(true),
        }
    }
}

impl SitePrefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `FOS_CERT_PINNING_*` environment variables
    pub fn from_env() -> Self {
        let prefs = Self::default();
        prefs.apply(&PrefsConfig::from_env());
        prefs
    }

    /// Apply every value present in a config
    pub fn apply(&self, config: &PrefsConfig) {
        if let Some(level) = config.enforcement_level {
            self.set_enforcement_level(EnforcementLevel::from_int(level));
        }
        if let Some(allow) = config.process_headers_from_non_builtin_roots {
            self.set_process_headers_from_non_builtin_roots(allow);
        }
        if let Some(cap) = config.hpkp_max_max_age_seconds {
            self.set_hpkp_max_max_age_seconds(cap);
        }
        if let Some(enabled) = config.hsts_enabled {
            self.hsts_enabled.store(enabled, Ordering::Relaxed);
        }
        if let Some(enabled) = config.hpkp_enabled {
            self.hpkp_enabled.store(enabled, Ordering::Relaxed);
        }
    }

    pub fn enforcement_level(&self) -> EnforcementLevel {
        EnforcementLevel::from_int(self.enforcement_level.load(Ordering::Relaxed) as i64)
    }

    pub fn set_enforcement_level(&self, level: EnforcementLevel) {
        self.enforcement_level.store(level.as_int(), Ordering::Relaxed);
    }

    pub fn process_headers_from_non_builtin_roots(&self) -> bool {
        self.process_headers_from_non_builtin_roots.load(Ordering::Relaxed)
    }

    pub fn set_process_headers_from_non_builtin_roots(&self, allow: bool) {
        self.process_headers_from_non_builtin_roots.store(allow, Ordering::Relaxed);
    }

    pub fn hpkp_max_max_age_seconds(&self) -> u64 {
        self.hpkp_max_max_age_seconds.load(Ordering::Relaxed)
    }

    pub fn set_hpkp_max_max_age_seconds(&self, cap: u64) {
        self.hpkp_max_max_age_seconds.store(cap, Ordering::Relaxed);
    }

    pub fn hsts_enabled(&self) -> bool {
        self.hsts_enabled.load(Ordering::Relaxed)
    }

    pub fn set_hsts_enabled(&self, enabled: bool) {
        self.hsts_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn hpkp_enabled(&self) -> bool {
        self.hpkp_enabled.load(Ordering::Relaxed)
    }

    pub fn set_hpkp_enabled(&self, enabled: bool) {
        self.hpkp_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Current values as a config
    pub fn to_config(&self) -> PrefsConfig {
        PrefsConfig {
            enforcement_level: Some(self.enforcement_level().as_int() as i64),
            process_headers_from_non_builtin_roots: Some(self.process_headers_from_non_builtin_roots()),
            hpkp_max_max_age_seconds: Some(self.hpkp_max_max_age_seconds()),
            hsts_enabled: Some(self.hsts_enabled()),
            hpkp_enabled: Some(self.hpkp_enabled()),
        }
    }
}

/// Serializable preference overrides; absent fields leave values untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PrefsConfig {
    pub enforcement_level: Option<i64>,
    pub process_headers_from_non_builtin_roots: Option<bool>,
    pub hpkp_max_max_age_seconds: Option<u64>,
    pub hsts_enabled: Option<bool>,
    pub hpkp_enabled: Option<bool>,
}

impl PrefsConfig {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read `FOS_CERT_PINNING_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        Self {
            enforcement_level: parse_var(&lookup, ENV_ENFORCEMENT_LEVEL),
            process_headers_from_non_builtin_roots: lookup(ENV_NON_BUILTIN_ROOTS)
                .and_then(|raw| parse_flag(ENV_NON_BUILTIN_ROOTS, &raw)),
            hpkp_max_max_age_seconds: parse_var(&lookup, ENV_MAX_MAX_AGE),
            hsts_enabled: None,
            hpkp_enabled: None,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::debug!(name, value = %raw, "ignoring unparseable preference");
            None
        }
    }
}

fn parse_flag(name: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => {
            tracing::debug!(name, value = %raw, "ignoring unparseable preference");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let prefs = SitePrefs::new();
        assert_eq!(prefs.enforcement_level(), EnforcementLevel::Strict);
        assert!(!prefs.process_headers_from_non_builtin_roots());
        assert_eq!(prefs.hpkp_max_max_age_seconds(), 5_184_000);
        assert!(prefs.hsts_enabled());
        assert!(prefs.hpkp_enabled());
    }

    #[test]
    fn test_level_from_int() {
        assert_eq!(EnforcementLevel::from_int(0), EnforcementLevel::Off);
        assert_eq!(EnforcementLevel::from_int(3), EnforcementLevel::EnforceTestMode);
        assert_eq!(EnforcementLevel::from_int(42), EnforcementLevel::Strict);
        assert_eq!(EnforcementLevel::from_int(-1), EnforcementLevel::Strict);
    }

    #[test]
    fn test_apply_json() {
        let prefs = SitePrefs::new();
        let config = PrefsConfig::from_json(
            r#"{"enforcement_level": 1, "process_headers_from_non_builtin_roots": true}"#,
        )
        .unwrap();
        prefs.apply(&config);
        assert_eq!(prefs.enforcement_level(), EnforcementLevel::AllowUserMitm);
        assert!(prefs.process_headers_from_non_builtin_roots());
        // Untouched
        assert_eq!(prefs.hpkp_max_max_age_seconds(), DEFAULT_HPKP_MAX_MAX_AGE_SECONDS);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_ENFORCEMENT_LEVEL, "0"),
            (ENV_NON_BUILTIN_ROOTS, "true"),
            (ENV_MAX_MAX_AGE, "not a number"),
        ]
        .into_iter()
        .collect();
        let config = PrefsConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.enforcement_level, Some(0));
        assert_eq!(config.process_headers_from_non_builtin_roots, Some(true));
        assert_eq!(config.hpkp_max_max_age_seconds, None);

        let vars: HashMap<&str, &str> = [(ENV_NON_BUILTIN_ROOTS, "1")].into_iter().collect();
        let config = PrefsConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.process_headers_from_non_builtin_roots, Some(true));
    }

    #[test]
    fn test_round_trip_config() {
        let prefs = SitePrefs::new();
        prefs.set_enforcement_level(EnforcementLevel::Off);
        let other = SitePrefs::new();
        other.apply(&prefs.to_config());
        assert_eq!(other.enforcement_level(), EnforcementLevel::Off);
    }
}
