//! Isolation Keys
//!
//! Validates caller-supplied origin attributes and projects them onto the
//! partition a policy record is stored under.
//!
//! Only the first-party domain partitions the store. The user context id is
//! validated for shape but two contexts differing only by it share records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PolicyKind, Result, SiteSecurityError};

/// Origin attributes of the browsing context making a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OriginAttributes {
    pub user_context_id: u32,
    pub first_party_domain: String,
}

impl OriginAttributes {
    pub fn new(user_context_id: u32, first_party_domain: &str) -> Self {
        Self {
            user_context_id,
            first_party_domain: first_party_domain.to_string(),
        }
    }

    /// Validate a raw attributes value against the strict wire shape
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(invalid(format!("expected an object, got {}", value_type(value))));
        };
        match map.get("userContextId") {
            Some(Value::Number(n)) if n.as_u64().is_some_and(|id| id <= u32::MAX as u64) => {}
            Some(other) => {
                return Err(invalid(format!(
                    "userContextId must be a non-negative 32-bit integer, got {}",
                    value_type(other)
                )));
            }
            None => return Err(invalid("missing userContextId".to_string())),
        }
        match map.get("firstPartyDomain") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(invalid(format!(
                    "firstPartyDomain must be a string, got {}",
                    value_type(other)
                )));
            }
            None => return Err(invalid("missing firstPartyDomain".to_string())),
        }
        // Catches unknown fields.
        serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))
    }

    /// Partition tag used in isolation keys
    pub fn partition(&self) -> &str {
        &self.first_party_domain
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "userContextId": self.user_context_id,
            "firstPartyDomain": self.first_party_domain,
        })
    }
}

/// Anything that can be validated into origin attributes
pub trait AsOriginAttributes {
    fn origin_attributes(&self) -> Result<OriginAttributes>;
}

impl AsOriginAttributes for OriginAttributes {
    fn origin_attributes(&self) -> Result<OriginAttributes> {
        Ok(self.clone())
    }
}

impl AsOriginAttributes for Value {
    fn origin_attributes(&self) -> Result<OriginAttributes> {
        OriginAttributes::from_value(self)
    }
}

/// `None` stands for an absent attributes argument and is always rejected.
impl<T: AsOriginAttributes> AsOriginAttributes for Option<T> {
    fn origin_attributes(&self) -> Result<OriginAttributes> {
        match self {
            Some(attrs) => attrs.origin_attributes(),
            None => Err(invalid("attributes are undefined".to_string())),
        }
    }
}

impl<T: AsOriginAttributes + ?Sized> AsOriginAttributes for &T {
    fn origin_attributes(&self) -> Result<OriginAttributes> {
        (**self).origin_attributes()
    }
}

/// Key a policy record is stored under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolationKey {
    pub host: String,
    pub kind: PolicyKind,
    pub partition: String,
}

impl IsolationKey {
    /// Derive the key for a host, rejecting malformed attributes
    pub fn derive<A>(kind: PolicyKind, host: &str, attrs: &A) -> Result<Self>
    where
        A: AsOriginAttributes + ?Sized,
    {
        let attrs = attrs.origin_attributes().inspect_err(|e| {
            tracing::warn!(%kind, host, "rejecting call: {e}");
        })?;
        let host = normalize_host(host)?;
        Ok(Self::new(kind, &host, attrs.partition()))
    }

    pub(crate) fn new(kind: PolicyKind, host: &str, partition: &str) -> Self {
        Self {
            host: host.to_string(),
            kind,
            partition: partition.to_string(),
        }
    }

    /// Same kind and partition for a different host
    pub(crate) fn with_host(&self, host: &str) -> Self {
        Self::new(self.kind, host, &self.partition)
    }

    /// Flat storage form, e.g. `example.com:HSTS^firstPartyDomain=foo.com`
    pub fn storage_key(&self) -> String {
        if self.partition.is_empty() {
            format!("{}:{}", self.host, self.kind)
        } else {
            format!("{}:{}^firstPartyDomain={}", self.host, self.kind, self.partition)
        }
    }
}

/// Lowercase a host and drop one trailing dot
pub fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim();
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return Err(SiteSecurityError::InvalidArgument("empty host".to_string()));
    }
    Ok(host.to_ascii_lowercase())
}

/// Check if host is an IP literal (these never carry policy)
pub fn is_ip_literal(host: &str) -> bool {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<std::net::IpAddr>().is_ok()
}

fn invalid(reason: String) -> SiteSecurityError {
    SiteSecurityError::InvalidIsolationKey(reason)
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
