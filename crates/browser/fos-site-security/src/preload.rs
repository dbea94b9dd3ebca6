//! Static Preload List
//!
//! Built-in HSTS/HPKP entries. The list is global, immutable after
//! construction, and never evicted by resets; a reset masks it with a
//! knockout in the dynamic table instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::PolicyKind;
use crate::isolation::normalize_host;
use crate::pin::{PinSet, SpkiHash};

/// One preloaded host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadEntry {
    pub host: String,
    pub kind: PolicyKind,
    #[serde(default)]
    pub include_subdomains: bool,
    /// Pinned keys (HPKP only)
    #[serde(default)]
    pub pins: Vec<SpkiHash>,
    /// Only enforced at the test-mode enforcement level
    #[serde(default)]
    pub test_mode: bool,
}

impl PreloadEntry {
    pub fn hsts(host: &str, include_subdomains: bool) -> Self {
        Self {
            host: host.to_string(),
            kind: PolicyKind::Hsts,
            include_subdomains,
            pins: Vec::new(),
            test_mode: false,
        }
    }

    pub fn hpkp(host: &str, include_subdomains: bool, pins: Vec<SpkiHash>) -> Self {
        Self {
            host: host.to_string(),
            kind: PolicyKind::Hpkp,
            include_subdomains,
            pins,
            test_mode: false,
        }
    }

    pub fn in_test_mode(mut self) -> Self {
        self.test_mode = true;
        self
    }

    pub fn pin_set(&self) -> PinSet {
        PinSet::from_hashes(self.pins.iter().copied())
    }
}

/// Lookup table of preloaded hosts
#[derive(Debug, Clone, Default)]
pub struct PreloadList {
    entries: HashMap<(String, PolicyKind), PreloadEntry>,
}

impl PreloadList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries; hosts that do not normalize are skipped
    pub fn from_entries<I: IntoIterator<Item = PreloadEntry>>(entries: I) -> Self {
        let mut list = Self::new();
        for entry in entries {
            list.insert(entry);
        }
        list
    }

    /// Parse a JSON array of entries
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<PreloadEntry> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries))
    }

    fn insert(&mut self, mut entry: PreloadEntry) {
        let Ok(host) = normalize_host(&entry.host) else {
            tracing::debug!(host = %entry.host, "skipping preload entry with empty host");
            return;
        };
        entry.host = host.clone();
        self.entries.insert((host, entry.kind), entry);
    }

    /// Exact-host entry
    pub fn get(&self, kind: PolicyKind, host: &str) -> Option<&PreloadEntry> {
        self.entries.get(&(host.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let list = PreloadList::from_json(
            r#"[
                {"host": "Preloaded.Example.", "kind": "hsts", "include_subdomains": true},
                {"host": "pinned.example", "kind": "hpkp",
                 "pins": ["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="], "test_mode": true}
            ]"#,
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        let hsts = list.get(PolicyKind::Hsts, "preloaded.example").unwrap();
        assert!(hsts.include_subdomains);
        let hpkp = list.get(PolicyKind::Hpkp, "pinned.example").unwrap();
        assert!(hpkp.test_mode);
        assert_eq!(hpkp.pin_set().len(), 1);
        assert!(list.get(PolicyKind::Hpkp, "preloaded.example").is_none());
    }

    #[test]
    fn test_bad_pin_rejected() {
        assert!(PreloadList::from_json(r#"[{"host": "a", "kind": "hpkp", "pins": ["AAAA"]}]"#).is_err());
    }

    #[test]
    fn test_empty_host_skipped() {
        let list = PreloadList::from_entries([PreloadEntry::hsts(".", false)]);
        assert!(list.is_empty());
    }
}
