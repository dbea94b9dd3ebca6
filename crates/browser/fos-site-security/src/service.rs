//! Site Security Service
//!
//! Public query and mutation surface. Each operation validates the
//! isolation attributes first, then composes the gate, the directive parser
//! and the policy store.

use std::sync::Arc;

use url::Url;

use crate::clock::{Clock, SystemClock, expiry_from_max_age};
use crate::directive::{self, DirectiveError};
use crate::gate::{EnforcementGate, GateDecision, RootKind, TrustSignal};
use crate::isolation::{AsOriginAttributes, IsolationKey, is_ip_literal};
use crate::pin::{PinSet, SpkiHash};
use crate::preload::PreloadList;
use crate::prefs::SitePrefs;
use crate::store::{Flags, PolicyEntry, PolicyStore, SiteEntry, Upsert};
use crate::{PolicyKind, Result, SiteSecurityError, Source};

/// Minimum number of distinct hashes `set_key_pins` accepts
pub const MIN_API_PINS: usize = 2;

/// Effect of a processed header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOutcome {
    /// Record created or replaced
    Applied {
        max_age_seconds: u64,
        include_subdomains: bool,
    },
    /// `max-age=0` removed the record
    Removed,
    /// Header dropped; existing state untouched
    Ignored(IgnoreReason),
}

/// Why a header was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    IpAddress,
    Gate(GateDecision),
    Malformed(DirectiveError),
    /// No pin matches the delivering chain
    NoActivePin,
    /// Every pin is in the delivering chain
    NoBackupPin,
}

/// Result of checking a chain against stored pins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    NoPolicy,
    Valid,
    Mismatch,
    /// Enforcement level does not apply pins to this chain
    Skipped,
}

/// Builder for [`SiteSecurityService`]
#[derive(Debug, Default)]
pub struct SiteSecurityServiceBuilder {
    prefs: Option<Arc<SitePrefs>>,
    clock: Option<Arc<dyn Clock>>,
    preload: PreloadList,
}

impl SiteSecurityServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a preference block with other components
    pub fn prefs(mut self, prefs: Arc<SitePrefs>) -> Self {
        self.prefs = Some(prefs);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn preload(mut self, preload: PreloadList) -> Self {
        self.preload = preload;
        self
    }

    pub fn build(self) -> SiteSecurityService {
        let prefs = self.prefs.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        SiteSecurityService {
            store: PolicyStore::new(self.preload, clock),
            gate: EnforcementGate::new(prefs),
        }
    }
}

/// HSTS/HPKP policy service
///
/// Owned explicitly and shared by handle (`Arc<SiteSecurityService>`);
/// every method takes `&self` and is safe to call from any thread.
#[derive(Debug)]
pub struct SiteSecurityService {
    store: PolicyStore,
    gate: EnforcementGate,
}

impl Default for SiteSecurityService {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteSecurityService {
    /// Service with default preferences, the system clock and no preloads
    pub fn new() -> Self {
        SiteSecurityServiceBuilder::new().build()
    }

    pub fn builder() -> SiteSecurityServiceBuilder {
        SiteSecurityServiceBuilder::new()
    }

    pub fn prefs(&self) -> &Arc<SitePrefs> {
        self.gate.prefs()
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Process a Strict-Transport-Security or Public-Key-Pins header
    ///
    /// Only malformed attributes fail. Anything wrong with the header or
    /// the connection yields `HeaderOutcome::Ignored` and changes nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn process_header<A>(
        &self,
        kind: PolicyKind,
        host: &str,
        header: &str,
        signal: &TrustSignal,
        flags: u32,
        source: Source,
        attrs: &A,
    ) -> Result<HeaderOutcome>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let key = IsolationKey::derive(kind, host, attrs)?;
        let flags = Flags::from_bits(flags);

        let outcome = self.apply_header(&key, header, signal, flags, source);
        match &outcome {
            HeaderOutcome::Ignored(reason) => {
                tracing::debug!(%kind, host = %key.host, ?reason, "ignoring {} header", kind.header_name());
            }
            applied => {
                tracing::debug!(%kind, key = %key.storage_key(), outcome = ?applied, "processed header");
            }
        }
        Ok(outcome)
    }

    fn apply_header(
        &self,
        key: &IsolationKey,
        header: &str,
        signal: &TrustSignal,
        flags: Flags,
        source: Source,
    ) -> HeaderOutcome {
        if is_ip_literal(&key.host) {
            return HeaderOutcome::Ignored(IgnoreReason::IpAddress);
        }

        let decision = self.gate.admit(key.kind, signal);
        if !decision.is_accept() {
            return HeaderOutcome::Ignored(IgnoreReason::Gate(decision));
        }

        let update = match directive::parse(key.kind, header) {
            Ok(update) => update,
            Err(e) => return HeaderOutcome::Ignored(IgnoreReason::Malformed(e)),
        };

        if update.is_removal() {
            self.forget(key, flags);
            return HeaderOutcome::Removed;
        }

        let (max_age_seconds, pins) = match key.kind {
            PolicyKind::Hsts => (update.max_age_seconds, PinSet::new()),
            PolicyKind::Hpkp => {
                let pins = PinSet::classify(&update.pins, &signal.chain);
                if !pins.has_active() {
                    return HeaderOutcome::Ignored(IgnoreReason::NoActivePin);
                }
                if !pins.has_backup() {
                    return HeaderOutcome::Ignored(IgnoreReason::NoBackupPin);
                }
                let cap = self.prefs().hpkp_max_max_age_seconds();
                (update.max_age_seconds.min(cap), pins)
            }
        };

        let expire_at_ms = expiry_from_max_age(self.store.now_ms(), max_age_seconds);
        let entry = PolicyEntry::active(expire_at_ms, update.include_subdomains, pins, source)
            .with_report_uri(update.report_uri);
        self.store.upsert(key.clone(), Upsert::Set(entry), flags);

        HeaderOutcome::Applied {
            max_age_seconds,
            include_subdomains: update.include_subdomains,
        }
    }

    /// Drop the record under `key`, leaving a knockout only when something
    /// behind it would otherwise show through: preload data, or in private
    /// mode a live normal record. Returns whether a knockout was written.
    fn forget(&self, key: &IsolationKey, flags: Flags) -> bool {
        let preloaded = self.store.preload().get(key.kind, &key.host).is_some();
        let shadowed = flags.is_private() && self.store.lookup(key, Flags::default()).is_some();
        if preloaded || shadowed {
            self.store.upsert(key.clone(), Upsert::Knockout, flags);
            true
        } else {
            self.store.remove(key, flags);
            false
        }
    }

    /// Check whether a host currently has policy of `kind`
    pub fn is_secure_uri<A>(&self, kind: PolicyKind, host: &str, flags: u32, attrs: &A) -> Result<bool>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let key = IsolationKey::derive(kind, host, attrs)?;
        if is_ip_literal(&key.host) {
            return Ok(false);
        }
        let resolved = self
            .store
            .resolve(&key, Flags::from_bits(flags), self.gate.enforces_test_mode());
        tracing::trace!(%kind, host = %key.host, secure = resolved.is_some(), "is_secure_uri");
        Ok(resolved.is_some())
    }

    /// [`is_secure_uri`](Self::is_secure_uri) for a parsed URL
    pub fn is_secure_url<A>(&self, kind: PolicyKind, url: &Url, flags: u32, attrs: &A) -> Result<bool>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let attrs = attrs.origin_attributes()?;
        let host = url
            .host_str()
            .ok_or_else(|| SiteSecurityError::InvalidArgument(format!("URL has no host: {url}")))?;
        self.is_secure_uri(kind, host, flags, &attrs)
    }

    /// Forget the record stored under exactly this key
    pub fn reset_state<A>(&self, kind: PolicyKind, host: &str, flags: u32, attrs: &A) -> Result<()>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let key = IsolationKey::derive(kind, host, attrs)?;
        let knockout = self.forget(&key, Flags::from_bits(flags));
        tracing::debug!(%kind, key = %key.storage_key(), knockout, "reset state");
        Ok(())
    }

    /// Install key pins directly, bypassing header parsing and the gate
    pub fn set_key_pins<A, S>(
        &self,
        host: &str,
        include_subdomains: bool,
        expire_at_ms: i64,
        hashes: &[S],
        is_preload: bool,
        attrs: &A,
    ) -> Result<()>
    where
        A: AsOriginAttributes + ?Sized,
        S: AsRef<str>,
    {
        let key = IsolationKey::derive(PolicyKind::Hpkp, host, attrs)?;

        let mut decoded = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let hash = hash.as_ref();
            let parsed = SpkiHash::from_base64(hash).ok_or_else(|| {
                SiteSecurityError::InvalidArgument(format!("not a base64 SHA-256 digest: {hash}"))
            })?;
            decoded.push(parsed);
        }
        let pins = PinSet::from_hashes(decoded);
        if pins.len() < MIN_API_PINS {
            return Err(SiteSecurityError::InvalidArgument(format!(
                "need at least {MIN_API_PINS} distinct pins, got {}",
                pins.len()
            )));
        }

        let source = if is_preload { Source::PreloadList } else { Source::Api };
        let entry = PolicyEntry::active(expire_at_ms, include_subdomains, pins, source);
        tracing::debug!(key = %key.storage_key(), expire_at_ms, ?source, "set key pins");
        self.store.upsert(key, Upsert::Set(entry), Flags::default());
        Ok(())
    }

    /// Install an HSTS record directly
    pub fn set_hsts_state<A>(
        &self,
        host: &str,
        include_subdomains: bool,
        expire_at_ms: i64,
        flags: u32,
        attrs: &A,
    ) -> Result<()>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let key = IsolationKey::derive(PolicyKind::Hsts, host, attrs)?;
        let entry = PolicyEntry::active(expire_at_ms, include_subdomains, PinSet::new(), Source::Api);
        tracing::debug!(key = %key.storage_key(), expire_at_ms, "set HSTS state");
        self.store.upsert(key, Upsert::Set(entry), Flags::from_bits(flags));
        Ok(())
    }

    /// Remove every dynamic record of every kind
    ///
    /// Knockouts go too, so static preload data applies again.
    pub fn clear_all(&self) {
        self.store.remove_all();
        tracing::info!("cleared all site security state");
    }

    /// Forget private browsing state, e.g. when the last private window closes
    pub fn clear_private(&self) {
        self.store.remove_private();
    }

    /// Pin set governing a host, if any
    pub fn key_pins<A>(&self, host: &str, flags: u32, attrs: &A) -> Result<Option<PinSet>>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let key = IsolationKey::derive(PolicyKind::Hpkp, host, attrs)?;
        if is_ip_literal(&key.host) {
            return Ok(None);
        }
        Ok(self
            .store
            .resolve(&key, Flags::from_bits(flags), self.gate.enforces_test_mode())
            .map(|resolved| resolved.entry.pins))
    }

    /// Check a verified chain against the pins governing `host`
    pub fn check_pins<A>(
        &self,
        host: &str,
        chain: &[SpkiHash],
        root: RootKind,
        flags: u32,
        attrs: &A,
    ) -> Result<PinCheck>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let pins = self.key_pins(host, flags, attrs)?;
        if !self.gate.enforces_pins(root) {
            return Ok(PinCheck::Skipped);
        }
        let check = match pins {
            None => PinCheck::NoPolicy,
            Some(pins) if pins.matches_chain(chain) => PinCheck::Valid,
            Some(_) => PinCheck::Mismatch,
        };
        if check == PinCheck::Mismatch {
            tracing::warn!(host, "certificate chain does not match pinned keys");
        }
        Ok(check)
    }

    /// Active non-private records of one kind
    pub fn entries(&self, kind: PolicyKind) -> Vec<SiteEntry> {
        self.store.entries(kind)
    }

    /// Reclaim memory held by expired records
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}
