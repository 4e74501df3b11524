//! `kv-plain` and `kv-tls`: an in-memory key-value store spoken to over a
//! RESP-framed TCP or TLS connection.
//!
//! Validation and connection establishment live here; the pooled backend
//! is in [`backend`], the wire codec in [`resp`].

mod backend;
mod resp;

use std::sync::Arc;

use crate::capability::Capability;
use crate::config::{parse_endpoint, parse_u32_in, ConfigMap, OptionSpec};
use crate::error::{ConfigError, Error};
use crate::operator::Backend;
use crate::path::normalize_root;
use crate::scheme::Scheme;

pub(crate) use backend::KvBackend;

pub(crate) const CAPABILITY: Capability = Capability {
    read: true,
    write: true,
    delete: true,
    list: true,
    stat: true,
    max_key_length: Some(512),
    ..Capability::none()
};

const SCHEMA_PLAIN: &[OptionSpec] = &[
    OptionSpec::required("endpoint"),
    OptionSpec::optional("root"),
    OptionSpec::optional("db"),
    OptionSpec::optional("username"),
    OptionSpec::optional("password"),
    OptionSpec::optional("pool-size"),
];

const SCHEMA_TLS: &[OptionSpec] = &[
    OptionSpec::required("endpoint"),
    OptionSpec::optional("root"),
    OptionSpec::optional("db"),
    OptionSpec::optional("username"),
    OptionSpec::optional("password"),
    OptionSpec::optional("pool-size"),
    OptionSpec::optional("insecure-skip-verify"),
];

/// Validated parameters for both kv schemes.
#[derive(Debug, Clone)]
pub(crate) struct KvParams {
    pub use_tls: bool,
    pub host: String,
    pub port: u16,
    pub root: String,
    pub db: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: usize,
    pub insecure_skip_verify: bool,
}

pub(crate) fn validate(scheme: Scheme, map: &ConfigMap) -> Result<KvParams, ConfigError> {
    let use_tls = scheme == Scheme::KvTls;
    map.check_schema(if use_tls { SCHEMA_TLS } else { SCHEMA_PLAIN })?;

    let endpoint = parse_endpoint(
        "endpoint",
        map.get("endpoint").unwrap_or_default(),
        &["tcp", "tls"],
        None,
    )?;
    // The transport the scheme promises and the transport the endpoint
    // names must agree.
    let expected = if use_tls { "tls" } else { "tcp" };
    if endpoint.scheme() != expected {
        return Err(ConfigError::inconsistent(
            &["scheme", "endpoint"],
            format!(
                "scheme `{}` requires a `{expected}://` endpoint, got `{}://`",
                scheme,
                endpoint.scheme()
            ),
        ));
    }
    let host = endpoint.host_str().unwrap_or_default().to_string();
    let port = endpoint
        .port()
        .ok_or_else(|| ConfigError::invalid("endpoint", "URI has no port"))?;

    let root_raw = map.get_or("root", "/");
    if root_raw.is_empty() {
        return Err(ConfigError::invalid("root", "must not be empty"));
    }

    let db = parse_u32_in("db", map.get_or("db", "0"), 0..=15)?;
    let pool_size = parse_u32_in("pool-size", map.get_or("pool-size", "4"), 1..=64)? as usize;

    // Empty credentials are values, not absences: an empty password is sent
    // to the server as-is.
    let username = map.get("username").map(str::to_string);
    let password = map.get("password").map(str::to_string);
    if username.is_some() && password.is_none() {
        return Err(ConfigError::inconsistent(
            &["username", "password"],
            "this protocol authenticates with a password; a username alone is not accepted",
        ));
    }

    let insecure_skip_verify = if use_tls {
        match map.get("insecure-skip-verify") {
            Some(raw) => crate::config::parse_bool("insecure-skip-verify", raw)?,
            None => false,
        }
    } else {
        false
    };

    Ok(KvParams {
        use_tls,
        host,
        port,
        root: normalize_root(root_raw),
        db,
        username,
        password,
        pool_size,
        insecure_skip_verify,
    })
}

/// Turn validated parameters into a live backend.
///
/// Plain TCP connects lazily on the first operation. TLS dials one
/// connection up front so certificate problems surface at build time as
/// `ConnectError::Handshake`.
pub(crate) async fn build(params: KvParams) -> Result<Arc<dyn Backend>, Error> {
    let backend = KvBackend::new(params)?;
    backend.verify_handshake_if_tls().await?;
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> ConfigMap {
        [
            ("endpoint", "tcp://127.0.0.1:6379"),
            ("root", "/"),
            ("db", "0"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn plain_scenario_validates() {
        let params = validate(Scheme::KvPlain, &base_map()).unwrap();
        assert!(!params.use_tls);
        assert_eq!(params.host, "127.0.0.1");
        assert_eq!(params.port, 6379);
        assert_eq!(params.root, "/");
        assert_eq!(params.db, 0);
        assert_eq!(params.pool_size, 4);
        assert_eq!(params.username, None);
        assert_eq!(params.password, None);
    }

    #[test]
    fn missing_endpoint_names_the_field() {
        let map: ConfigMap = [("root", "/")].into_iter().collect();
        assert_eq!(
            validate(Scheme::KvPlain, &map).unwrap_err(),
            ConfigError::MissingField("endpoint".to_string())
        );
    }

    #[test]
    fn tls_scheme_rejects_plain_endpoint() {
        let err = validate(Scheme::KvTls, &base_map()).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent { fields, .. }
            if fields == ["scheme", "endpoint"]));
    }

    #[test]
    fn db_index_is_range_checked() {
        let mut map = base_map();
        map.insert("db", "16");
        assert!(matches!(
            validate(Scheme::KvPlain, &map).unwrap_err(),
            ConfigError::InvalidValue { field, .. } if field == "db"
        ));
    }

    #[test]
    fn username_without_password_is_inconsistent() {
        let mut map = base_map();
        map.insert("username", "app");
        assert!(matches!(
            validate(Scheme::KvPlain, &map).unwrap_err(),
            ConfigError::Inconsistent { .. }
        ));
    }

    #[test]
    fn empty_password_is_a_credential_not_an_absence() {
        let mut map = base_map();
        map.insert("password", "");
        let params = validate(Scheme::KvPlain, &map).unwrap();
        assert_eq!(params.password.as_deref(), Some(""));
    }

    #[test]
    fn root_is_normalized() {
        let mut map = base_map();
        map.insert("root", "/a//b/");
        assert_eq!(validate(Scheme::KvPlain, &map).unwrap().root, "/a/b");
    }

    #[test]
    fn skip_verify_is_tls_only_under_strict_validation() {
        let mut map = base_map();
        map.insert("insecure-skip-verify", "true");
        let strict = map.strict(true);
        assert_eq!(
            validate(Scheme::KvPlain, &strict).unwrap_err(),
            ConfigError::UnknownField("insecure-skip-verify".to_string())
        );
    }

    #[test]
    fn validation_is_deterministic() {
        let map = base_map();
        let a = validate(Scheme::KvPlain, &map).unwrap();
        let b = validate(Scheme::KvPlain, &map).unwrap();
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }
}
