//! Enforcement Gate
//!
//! Decides whether a header received on a connection is honored at all.
//! Rejection is never an error; the header is simply dropped.

use std::sync::Arc;

use crate::PolicyKind;
use crate::pin::SpkiHash;
use crate::prefs::{EnforcementLevel, SitePrefs};

/// Class of trust anchor a verified chain ends at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RootKind {
    /// Shipped with the browser
    #[default]
    BuiltIn,
    /// Added by the user or an enterprise policy
    NonBuiltIn,
}

/// What the TLS layer reports about the connection a header arrived on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustSignal {
    /// Chain verified without overridden errors
    pub trusted: bool,
    pub root: RootKind,
    /// SPKI hashes of the verified chain, leaf first
    pub chain: Vec<SpkiHash>,
}

impl TrustSignal {
    /// Trusted connection rooted at a built-in anchor
    pub fn built_in(chain: Vec<SpkiHash>) -> Self {
        Self {
            trusted: true,
            root: RootKind::BuiltIn,
            chain,
        }
    }

    /// Trusted connection rooted at a user-added anchor
    pub fn non_built_in(chain: Vec<SpkiHash>) -> Self {
        Self {
            trusted: true,
            root: RootKind::NonBuiltIn,
            chain,
        }
    }

    /// Connection with certificate errors
    pub fn untrusted() -> Self {
        Self::default()
    }
}

/// Gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    /// Connection not trustworthy
    Untrusted,
    /// Policy kind switched off
    Disabled,
    /// HPKP header over a chain rooted at a non-built-in anchor
    NonBuiltInRoot,
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        *self == Self::Accept
    }
}

/// Header acceptance policy backed by live preferences
#[derive(Debug, Clone)]
pub struct EnforcementGate {
    prefs: Arc<SitePrefs>,
}

impl EnforcementGate {
    pub fn new(prefs: Arc<SitePrefs>) -> Self {
        Self { prefs }
    }

    pub fn prefs(&self) -> &Arc<SitePrefs> {
        &self.prefs
    }

    /// Check whether a header of `kind` from this connection is honored
    pub fn admit(&self, kind: PolicyKind, signal: &TrustSignal) -> GateDecision {
        if !signal.trusted {
            return GateDecision::Untrusted;
        }
        match kind {
            PolicyKind::Hsts => {
                if !self.prefs.hsts_enabled() {
                    return GateDecision::Disabled;
                }
            }
            PolicyKind::Hpkp => {
                if !self.prefs.hpkp_enabled() || self.prefs.enforcement_level() == EnforcementLevel::Off {
                    return GateDecision::Disabled;
                }
                if signal.root == RootKind::NonBuiltIn && !self.prefs.process_headers_from_non_builtin_roots() {
                    return GateDecision::NonBuiltInRoot;
                }
            }
        }
        GateDecision::Accept
    }

    /// Check whether stored pins apply to a chain ending at `root`
    pub fn enforces_pins(&self, root: RootKind) -> bool {
        match self.prefs.enforcement_level() {
            EnforcementLevel::Off => false,
            EnforcementLevel::AllowUserMitm => root == RootKind::BuiltIn,
            EnforcementLevel::Strict | EnforcementLevel::EnforceTestMode => true,
        }
    }

    /// Test-mode preload entries only count at the top tier
    pub fn enforces_test_mode(&self) -> bool {
        self.prefs.enforcement_level() == EnforcementLevel::EnforceTestMode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> EnforcementGate {
        EnforcementGate::new(Arc::new(SitePrefs::new()))
    }

    #[test]
    fn test_untrusted_rejected() {
        let gate = gate();
        assert_eq!(gate.admit(PolicyKind::Hsts, &TrustSignal::untrusted()), GateDecision::Untrusted);
        assert_eq!(gate.admit(PolicyKind::Hpkp, &TrustSignal::untrusted()), GateDecision::Untrusted);
    }

    #[test]
    fn test_non_builtin_root() {
        let gate = gate();
        let signal = TrustSignal::non_built_in(vec![]);
        // HSTS is never gated by root class
        assert!(gate.admit(PolicyKind::Hsts, &signal).is_accept());
        assert_eq!(gate.admit(PolicyKind::Hpkp, &signal), GateDecision::NonBuiltInRoot);

        gate.prefs().set_process_headers_from_non_builtin_roots(true);
        assert!(gate.admit(PolicyKind::Hpkp, &signal).is_accept());
    }

    #[test]
    fn test_level_off_disables_hpkp() {
        let gate = gate();
        gate.prefs().set_enforcement_level(EnforcementLevel::Off);
        let signal = TrustSignal::built_in(vec![]);
        assert_eq!(gate.admit(PolicyKind::Hpkp, &signal), GateDecision::Disabled);
        assert!(gate.admit(PolicyKind::Hsts, &signal).is_accept());
        assert!(!gate.enforces_pins(RootKind::BuiltIn));
    }

    #[test]
    fn test_enforces_pins_by_level() {
        let gate = gate();
        assert!(gate.enforces_pins(RootKind::NonBuiltIn));
        gate.prefs().set_enforcement_level(EnforcementLevel::AllowUserMitm);
        assert!(gate.enforces_pins(RootKind::BuiltIn));
        assert!(!gate.enforces_pins(RootKind::NonBuiltIn));
        assert!(!gate.enforces_test_mode());
    }
}
