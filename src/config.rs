//! Flat string configuration and the typed parse helpers validators share.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use url::Url;

use crate::error::ConfigError;

/// Immutable string→string configuration, the sole input format across all
/// schemes.
///
/// Keys are case-sensitive. Unknown keys are ignored unless the map is
/// marked [`strict`](ConfigMap::strict). The map is consumed once by a
/// scheme validator and never re-read afterwards.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    // BTreeMap keeps validation deterministic: the first unknown key
    // reported in strict mode does not depend on hash order.
    entries: BTreeMap<String, String>,
    strict: bool,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable strict validation: keys the scheme does not recognize become
    /// [`ConfigError::UnknownField`] instead of being ignored.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Check required keys and, in strict mode, unknown keys against the
    /// scheme's option schema. Runs before any typed parsing.
    pub(crate) fn check_schema(&self, schema: &[OptionSpec]) -> Result<(), ConfigError> {
        for opt in schema {
            if opt.required && !self.entries.contains_key(opt.name) {
                return Err(ConfigError::MissingField(opt.name.to_string()));
            }
        }
        if self.strict {
            for key in self.entries.keys() {
                if !schema.iter().any(|opt| opt.name == key) {
                    return Err(ConfigError::UnknownField(key.clone()));
                }
            }
        }
        Ok(())
    }

    /// Value of `key`, or the scheme default when the key is entirely
    /// absent. A present-but-empty value is returned as-is, never
    /// defaulted.
    pub(crate) fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

impl FromIterator<(String, String)> for ConfigMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            strict: false,
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for ConfigMap {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// One recognized configuration key of a scheme.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OptionSpec {
    pub name: &'static str,
    pub required: bool,
}

impl OptionSpec {
    pub(crate) const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub(crate) const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// Parse a boolean field. Accepted literals: `true`/`false`/`on`/`off`,
/// case-insensitive.
pub(crate) fn parse_bool(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" => Ok(true),
        "false" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(
            field,
            format!("`{raw}` is not a boolean (expected true/false/on/off)"),
        )),
    }
}

/// Parse a non-negative integer field and range-check it.
pub(crate) fn parse_u32_in(
    field: &str,
    raw: &str,
    range: RangeInclusive<u32>,
) -> Result<u32, ConfigError> {
    let value: u32 = raw.parse().map_err(|_| {
        ConfigError::invalid(field, format!("`{raw}` is not a non-negative integer"))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::invalid(
            field,
            format!(
                "{value} is out of range (expected {}..={})",
                range.start(),
                range.end()
            ),
        ));
    }
    Ok(value)
}

/// Parse an endpoint URI into scheme+host+port. `allowed` lists the URI
/// schemes the backend understands; `default_port` supplies the port for
/// protocols that have a well-known one.
pub(crate) fn parse_endpoint(
    field: &str,
    raw: &str,
    allowed: &[&str],
    default_port: Option<u16>,
) -> Result<Url, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::invalid(field, format!("`{raw}` is not a valid URI: {e}")))?;
    if !allowed.contains(&url.scheme()) {
        return Err(ConfigError::invalid(
            field,
            format!(
                "URI scheme `{}` is not supported here (expected one of {allowed:?})",
                url.scheme()
            ),
        ));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::invalid(field, "URI has no host"));
    }
    if url.port_or_known_default().is_none() && default_port.is_none() {
        return Err(ConfigError::invalid(field, "URI has no port"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_literals() {
        assert!(parse_bool("tls", "TRUE").unwrap());
        assert!(parse_bool("tls", "on").unwrap());
        assert!(!parse_bool("tls", "Off").unwrap());
        assert!(!parse_bool("tls", "false").unwrap());
        let err = parse_bool("tls", "yes").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "tls"));
    }

    #[test]
    fn integer_range_check() {
        assert_eq!(parse_u32_in("db", "7", 0..=15).unwrap(), 7);
        assert!(parse_u32_in("db", "16", 0..=15).is_err());
        assert!(parse_u32_in("db", "-1", 0..=15).is_err());
        assert!(parse_u32_in("db", "abc", 0..=15).is_err());
    }

    #[test]
    fn schema_reports_exact_missing_key() {
        let schema = &[
            OptionSpec::required("endpoint"),
            OptionSpec::optional("root"),
        ];
        let map: ConfigMap = [("root", "/")].into_iter().collect();
        assert_eq!(
            map.check_schema(schema).unwrap_err(),
            ConfigError::MissingField("endpoint".to_string())
        );
    }

    #[test]
    fn unknown_keys_ignored_unless_strict() {
        let schema = &[OptionSpec::required("endpoint")];
        let lax: ConfigMap = [("endpoint", "tcp://h:1"), ("bogus", "x")]
            .into_iter()
            .collect();
        assert!(lax.check_schema(schema).is_ok());

        let strict = lax.clone().strict(true);
        assert_eq!(
            strict.check_schema(schema).unwrap_err(),
            ConfigError::UnknownField("bogus".to_string())
        );
    }

    #[test]
    fn defaults_apply_only_when_absent() {
        let map: ConfigMap = [("root", "")].into_iter().collect();
        // Present-but-empty stays empty; the default is not substituted.
        assert_eq!(map.get_or("root", "/"), "");
        assert_eq!(map.get_or("db", "0"), "0");
    }

    #[test]
    fn endpoint_parsing() {
        let url = parse_endpoint("endpoint", "tcp://127.0.0.1:6379", &["tcp", "tls"], None)
            .unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(6379));

        assert!(parse_endpoint("endpoint", "not a uri", &["tcp"], None).is_err());
        assert!(parse_endpoint("endpoint", "ftp://h:21", &["tcp"], None).is_err());
        assert!(parse_endpoint("endpoint", "", &["tcp"], None).is_err());
    }
}
