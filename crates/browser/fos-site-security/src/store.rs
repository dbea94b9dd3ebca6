//! Policy Store
//!
//! Keyed table of policy records with lazy expiry, knockouts, a separate
//! private-browsing table and the static preload list behind them.
//!
//! Every public method takes the table lock once, so each call is atomic
//! with respect to every other. Nothing inside the lock blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::isolation::IsolationKey;
use crate::pin::PinSet;
use crate::preload::PreloadList;
use crate::{PolicyKind, Source};

/// Call flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: u32 = 0;
    /// Private browsing: writes go to the private table
    pub const PRIVATE: u32 = 1 << 0;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_private(&self) -> bool {
        self.0 & Self::PRIVATE != 0
    }
}

/// Record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Active,
    /// Policy explicitly disabled for this key; masks preload data
    Knockout,
}

/// One policy record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Milliseconds since the Unix epoch
    pub expire_at_ms: i64,
    pub state: EntryState,
    pub include_subdomains: bool,
    /// Empty for HSTS
    #[serde(default)]
    pub pins: PinSet,
    pub source: Source,
    /// HPKP violation report endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_uri: Option<String>,
}

impl PolicyEntry {
    pub fn active(expire_at_ms: i64, include_subdomains: bool, pins: PinSet, source: Source) -> Self {
        Self {
            expire_at_ms,
            state: EntryState::Active,
            include_subdomains,
            pins,
            source,
            report_uri: None,
        }
    }

    pub fn with_report_uri(mut self, report_uri: Option<String>) -> Self {
        self.report_uri = report_uri;
        self
    }

    /// Knockouts do not expire; they last until replaced or cleared
    pub fn knockout(source: Source) -> Self {
        Self {
            expire_at_ms: i64::MAX,
            state: EntryState::Knockout,
            include_subdomains: false,
            pins: PinSet::new(),
            source,
            report_uri: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.state == EntryState::Active && now_ms >= self.expire_at_ms
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        self.state == EntryState::Active && now_ms < self.expire_at_ms
    }
}

/// Record together with its key, for enumeration and snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub key: IsolationKey,
    pub entry: PolicyEntry,
}

/// Change applied by [`PolicyStore::upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// Insert or replace; the newest record always wins
    Set(PolicyEntry),
    /// Replace any record with a knockout
    Knockout,
}

/// Policy found for a host, possibly through a superdomain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Host the record is stored under
    pub host: String,
    pub entry: PolicyEntry,
    pub from_preload: bool,
    pub test_mode: bool,
}

#[derive(Debug, Default)]
struct Tables {
    normal: HashMap<IsolationKey, PolicyEntry>,
    private: HashMap<IsolationKey, PolicyEntry>,
}

impl Tables {
    fn table_mut(&mut self, flags: Flags) -> &mut HashMap<IsolationKey, PolicyEntry> {
        if flags.is_private() {
            &mut self.private
        } else {
            &mut self.normal
        }
    }

    /// Private records shadow normal ones in private mode
    fn find(&self, key: &IsolationKey, flags: Flags, now_ms: i64) -> Option<&PolicyEntry> {
        let live = |entry: &&PolicyEntry| !entry.is_expired(now_ms);
        if flags.is_private() {
            if let Some(entry) = self.private.get(key).filter(live) {
                return Some(entry);
            }
        }
        self.normal.get(key).filter(live)
    }
}

/// Process-wide policy table
#[derive(Debug)]
pub struct PolicyStore {
    tables: Mutex<Tables>,
    preload: PreloadList,
    clock: Arc<dyn Clock>,
}

impl PolicyStore {
    pub fn new(preload: PreloadList, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            preload,
            clock,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn preload(&self) -> &PreloadList {
        &self.preload
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Critical sections only touch hash maps, so a poisoned lock still
        // guards consistent data.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an update to a single key
    pub fn upsert(&self, key: IsolationKey, change: Upsert, flags: Flags) {
        let mut tables = self.lock();
        let table = tables.table_mut(flags);
        match change {
            Upsert::Set(entry) => {
                tracing::trace!(key = %key.storage_key(), expire_at_ms = entry.expire_at_ms, "store set");
                table.insert(key, entry);
            }
            Upsert::Knockout => {
                tracing::trace!(key = %key.storage_key(), "store knockout");
                table.insert(key, PolicyEntry::knockout(Source::Unknown));
            }
        }
    }

    /// Active, unexpired record for exactly this key
    pub fn lookup(&self, key: &IsolationKey, flags: Flags) -> Option<PolicyEntry> {
        let now = self.now_ms();
        let tables = self.lock();
        tables
            .find(key, flags, now)
            .filter(|entry| entry.is_active(now))
            .cloned()
    }

    /// Unconditional delete from the table `flags` selects
    ///
    /// Returns whether a record (expired or not) was there.
    pub fn remove(&self, key: &IsolationKey, flags: Flags) -> bool {
        let removed = self.lock().table_mut(flags).remove(key).is_some();
        if removed {
            tracing::trace!(key = %key.storage_key(), "store remove");
        }
        removed
    }

    /// Drop every record of every kind, private ones included
    pub fn remove_all(&self) {
        let mut tables = self.lock();
        tables.normal.clear();
        tables.private.clear();
    }

    /// Drop only the private table
    pub fn remove_private(&self) {
        self.lock().private.clear();
    }

    /// Find the record governing `key.host`
    ///
    /// Walks from the exact host up through its superdomains and stops at
    /// the first level holding a dynamic record or preload entry. A
    /// superdomain record only counts when it includes subdomains; a
    /// knockout at any visited level ends the walk with nothing.
    pub fn resolve(&self, key: &IsolationKey, flags: Flags, include_test_mode: bool) -> Option<Resolved> {
        let now = self.now_ms();
        let tables = self.lock();

        for (depth, host) in superdomains(&key.host).enumerate() {
            let exact = depth == 0;
            let level_key = key.with_host(host);

            if let Some(entry) = tables.find(&level_key, flags, now) {
                if entry.state == EntryState::Knockout {
                    return None;
                }
                if exact || entry.include_subdomains {
                    return Some(Resolved {
                        host: host.to_string(),
                        entry: entry.clone(),
                        from_preload: false,
                        test_mode: false,
                    });
                }
                return None;
            }

            if let Some(preload) = self.preload.get(key.kind, host) {
                if preload.test_mode && !include_test_mode {
                    continue;
                }
                if exact || preload.include_subdomains {
                    return Some(Resolved {
                        host: host.to_string(),
                        entry: PolicyEntry::active(
                            i64::MAX,
                            preload.include_subdomains,
                            preload.pin_set(),
                            Source::PreloadList,
                        ),
                        from_preload: true,
                        test_mode: preload.test_mode,
                    });
                }
                return None;
            }
        }
        None
    }

    /// Drop expired records; query results do not change
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        let mut tables = self.lock();
        let before = tables.normal.len() + tables.private.len();
        tables.normal.retain(|_, entry| !entry.is_expired(now));
        tables.private.retain(|_, entry| !entry.is_expired(now));
        let purged = before - (tables.normal.len() + tables.private.len());
        if purged > 0 {
            tracing::debug!(purged, "purged expired site security records");
        }
        purged
    }

    /// Active non-private records of one kind
    pub fn entries(&self, kind: PolicyKind) -> Vec<SiteEntry> {
        let now = self.now_ms();
        let tables = self.lock();
        let mut entries: Vec<SiteEntry> = tables
            .normal
            .iter()
            .filter(|(key, entry)| key.kind == kind && entry.is_active(now))
            .map(|(key, entry)| SiteEntry {
                key: key.clone(),
                entry: entry.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.storage_key().cmp(&b.key.storage_key()));
        entries
    }

    /// Active non-private records of every kind
    ///
    /// Knockouts stay behind; they only last for the session.
    pub(crate) fn export(&self) -> Vec<SiteEntry> {
        let now = self.now_ms();
        let tables = self.lock();
        let mut entries: Vec<SiteEntry> = tables
            .normal
            .iter()
            .filter(|(_, entry)| entry.is_active(now))
            .map(|(key, entry)| SiteEntry {
                key: key.clone(),
                entry: entry.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.storage_key().cmp(&b.key.storage_key()));
        entries
    }

    /// Merge persisted records; live records for the same key win
    pub(crate) fn import(&self, entries: Vec<SiteEntry>) -> usize {
        let now = self.now_ms();
        let mut tables = self.lock();
        let mut imported = 0;
        for SiteEntry { key, entry } in entries {
            let live = tables.normal.get(&key).is_some_and(|existing| !existing.is_expired(now));
            if !entry.is_active(now) || live {
                continue;
            }
            tables.normal.insert(key, entry);
            imported += 1;
        }
        imported
    }

    /// Number of stored records, expired ones included
    pub fn len(&self) -> usize {
        let tables = self.lock();
        tables.normal.len() + tables.private.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `a.b.c` yields `a.b.c`, `b.c`, `c`
fn superdomains(host: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(host), |h| h.split_once('.').map(|(_, rest)| rest))
        .filter(|h| !h.is_empty())
}
