//! Snapshot Persistence
//!
//! Serializes non-private records so they survive a restart. Writing a
//! snapshot happens after the in-memory update has committed; losing the
//! last few updates on a crash is acceptable.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::service::SiteSecurityService;
use crate::store::SiteEntry;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistence error
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),
}

/// Persisted site security state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub entries: Vec<SiteEntry>,
}

impl Snapshot {
    pub fn new(entries: Vec<SiteEntry>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries,
        }
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), PersistError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, PersistError> {
        let snapshot: Self = serde_json::from_reader(reader)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SiteSecurityService {
    /// Active non-private records
    ///
    /// Knockouts are left out, so a reset lasts for the session only.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.store().export())
    }

    /// Merge a snapshot into the live tables
    ///
    /// Expired records are skipped and live records are never overwritten.
    /// Returns the number of records restored.
    pub fn restore(&self, snapshot: Snapshot) -> Result<usize, PersistError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistError::UnsupportedVersion(snapshot.version));
        }
        let restored = self.store().import(snapshot.entries);
        tracing::info!(restored, "restored site security state");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::isolation::OriginAttributes;
    use crate::preload::{PreloadEntry, PreloadList};
    use crate::store::Flags;
    use crate::{PolicyKind, Source, TrustSignal};
    use std::sync::Arc;

    fn service(now: i64) -> SiteSecurityService {
        SiteSecurityService::builder()
            .clock(Arc::new(ManualClock::new(now)))
            .build()
    }

    #[test]
    fn test_snapshot_round_trip() {
        let sss = service(1_000);
        let attrs = OriginAttributes::new(0, "foo.com");
        sss.process_header(
            PolicyKind::Hsts,
            "a.example",
            "max-age=100; includeSubDomains",
            &TrustSignal::built_in(vec![]),
            0,
            Source::OrganicRequest,
            &attrs,
        )
        .unwrap();
        // Private records are not persisted
        sss.set_hsts_state("private.example", false, i64::MAX, Flags::PRIVATE, &attrs).unwrap();

        let mut buf = Vec::new();
        sss.snapshot().to_writer(&mut buf).unwrap();
        let snapshot = Snapshot::from_reader(buf.as_slice()).unwrap();
        assert_eq!(snapshot.len(), 1);

        let fresh = service(2_000);
        assert_eq!(fresh.restore(snapshot).unwrap(), 1);
        assert!(fresh.is_secure_uri(PolicyKind::Hsts, "b.a.example", 0, &attrs).unwrap());
        assert!(!fresh.is_secure_uri(PolicyKind::Hsts, "a.example", 0, &OriginAttributes::default()).unwrap());
    }

    #[test]
    fn test_expired_records_skipped() {
        let sss = service(1_000);
        sss.set_hsts_state("a.example", false, 5_000, 0, &OriginAttributes::default()).unwrap();
        let snapshot = sss.snapshot();

        let later = service(10_000);
        assert_eq!(later.restore(snapshot).unwrap(), 0);
    }

    #[test]
    fn test_restore_over_expired_record() {
        let clock = Arc::new(ManualClock::new(1_000));
        let sss = SiteSecurityService::builder().clock(clock.clone()).build();
        let attrs = OriginAttributes::default();
        sss.set_hsts_state("a.example", false, 2_000, 0, &attrs).unwrap();
        clock.set(5_000);

        let saved = service(1_000);
        saved.set_hsts_state("a.example", false, 1_000_000, 0, &attrs).unwrap();
        assert_eq!(sss.restore(saved.snapshot()).unwrap(), 1);
        assert!(sss.is_secure_uri(PolicyKind::Hsts, "a.example", 0, &attrs).unwrap());
    }

    #[test]
    fn test_reset_not_persisted() {
        let sss = SiteSecurityService::builder()
            .clock(Arc::new(ManualClock::new(0)))
            .preload(PreloadList::from_entries([PreloadEntry::hsts("preloaded.example", false)]))
            .build();
        let attrs = OriginAttributes::default();
        sss.reset_state(PolicyKind::Hsts, "preloaded.example", 0, &attrs).unwrap();
        assert!(!sss.is_secure_uri(PolicyKind::Hsts, "preloaded.example", 0, &attrs).unwrap());
        assert!(sss.snapshot().is_empty());
    }

    #[test]
    fn test_version_checked() {
        let json = r#"{"version": 99, "entries": []}"#;
        assert!(matches!(
            Snapshot::from_reader(json.as_bytes()),
            Err(PersistError::UnsupportedVersion(99))
        ));
    }
}
