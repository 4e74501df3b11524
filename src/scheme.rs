//! The closed registry of supported backend schemes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::capability::Capability;
use crate::error::ConfigError;
use crate::services;

/// Identifier for one supported backend kind.
///
/// The set is closed: every scheme has exactly one validator, one builder
/// and one static capability descriptor, and that triple is total — any
/// config map either validates or produces a field-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    /// In-memory key-value store over plain TCP.
    KvPlain,
    /// In-memory key-value store over TLS.
    KvTls,
    /// Relational table used as a key-value store.
    RelationalKv,
    /// HTTP remote filesystem speaking WebDAV.
    Webdav,
}

static REGISTRY: Lazy<BTreeMap<&'static str, Scheme>> = Lazy::new(|| {
    BTreeMap::from([
        ("kv-plain", Scheme::KvPlain),
        ("kv-tls", Scheme::KvTls),
        ("relational-kv", Scheme::RelationalKv),
        ("webdav", Scheme::Webdav),
    ])
});

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::KvPlain => "kv-plain",
            Scheme::KvTls => "kv-tls",
            Scheme::RelationalKv => "relational-kv",
            Scheme::Webdav => "webdav",
        }
    }

    /// All registered schemes, in name order.
    pub fn all() -> impl Iterator<Item = Scheme> {
        REGISTRY.values().copied()
    }

    /// The scheme's static capability descriptor.
    pub fn capability(&self) -> Capability {
        match self {
            Scheme::KvPlain | Scheme::KvTls => services::kv::CAPABILITY,
            Scheme::RelationalKv => services::relational::CAPABILITY,
            Scheme::Webdav => services::webdav::CAPABILITY,
        }
    }
}

impl FromStr for Scheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REGISTRY.get(s).copied().ok_or_else(|| {
            ConfigError::invalid(
                "scheme",
                format!(
                    "`{s}` is not a registered scheme (known: {})",
                    REGISTRY.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            )
        })
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips_names() {
        for scheme in Scheme::all() {
            assert_eq!(scheme.as_str().parse::<Scheme>().unwrap(), scheme);
        }
    }

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let err = "s3".parse::<Scheme>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "scheme"));
    }

    #[test]
    fn capability_tables_are_static() {
        // Same scheme, same descriptor, every time.
        assert_eq!(Scheme::KvPlain.capability(), Scheme::KvPlain.capability());
        assert_eq!(Scheme::KvPlain.capability(), Scheme::KvTls.capability());
        assert!(!Scheme::KvPlain.capability().rename);
        assert!(Scheme::Webdav.capability().rename);
    }
}
