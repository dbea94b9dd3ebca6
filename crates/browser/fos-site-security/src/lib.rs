//! fOS Site Security
//!
//! Per-origin transport security policy for the fOS browser engine.
//!
//! Features:
//! - HSTS (Strict-Transport-Security) header processing
//! - HPKP (Public-Key-Pins) header processing and pin checks
//! - Isolation by first-party domain
//! - Private browsing tables
//! - Static preload list with per-partition knockouts
//! - Runtime preferences and enforcement gate
//! - Snapshot persistence
//!
//! # Example
//! ```rust,ignore
//! use fos_site_security::{OriginAttributes, PolicyKind, SiteSecurityService, Source, TrustSignal};
//!
//! let sss = SiteSecurityService::new();
//! let attrs = OriginAttributes::default();
//! sss.process_header(
//!     PolicyKind::Hsts,
//!     "example.com",
//!     "max-age=31536000",
//!     &TrustSignal::built_in(vec![]),
//!     0,
//!     Source::OrganicRequest,
//!     &attrs,
//! )?;
//! assert!(sss.is_secure_uri(PolicyKind::Hsts, "example.com", 0, &attrs)?);
//! ```

pub mod clock;
pub mod directive;
pub mod gate;
pub mod isolation;
pub mod persist;
pub mod pin;
pub mod preload;
pub mod prefs;
pub mod service;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directive::{DirectiveError, PolicyUpdate};
pub use gate::{EnforcementGate, GateDecision, RootKind, TrustSignal};
pub use isolation::{AsOriginAttributes, IsolationKey, OriginAttributes};
pub use persist::{PersistError, Snapshot};
pub use pin::{Pin, PinSet, SpkiHash};
pub use preload::{PreloadEntry, PreloadList};
pub use prefs::{EnforcementLevel, PrefsConfig, SitePrefs};
pub use service::{HeaderOutcome, IgnoreReason, PinCheck, SiteSecurityService, SiteSecurityServiceBuilder};
pub use store::{EntryState, Flags, PolicyEntry, SiteEntry};

/// Kind of transport security policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Strict-Transport-Security
    Hsts,
    /// Public-Key-Pins
    Hpkp,
}

impl PolicyKind {
    /// Header name carrying this policy
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Hsts => "Strict-Transport-Security",
            Self::Hpkp => "Public-Key-Pins",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hsts => "HSTS",
            Self::Hpkp => "HPKP",
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a policy record came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    #[default]
    Unknown,
    /// Built-in or API-installed preload data
    PreloadList,
    /// Header seen on a regular response
    OrganicRequest,
    /// Installed directly through the API
    Api,
}

/// Site security error
///
/// Only caller mistakes surface as errors. Problems with header text from
/// the network are absorbed and reported through [`HeaderOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiteSecurityError {
    #[error("Invalid isolation key: {0}")]
    InvalidIsolationKey(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, SiteSecurityError>;
