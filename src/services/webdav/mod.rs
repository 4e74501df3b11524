//! `webdav`: an HTTP remote filesystem.
//!
//! The transport is a shared HTTP client with a bounded redirect policy.
//! Listing and stat go through PROPFIND, rename and copy through the
//! protocol's native MOVE/COPY, so this is the one scheme whose capability
//! descriptor enables them.

mod backend;

use std::sync::Arc;

use url::Url;

use crate::capability::Capability;
use crate::config::{parse_bool, parse_endpoint, ConfigMap, OptionSpec};
use crate::error::{ConfigError, Error};
use crate::operator::Backend;
use crate::path::normalize_root;

pub(crate) use backend::WebdavBackend;

/// Redirect hops followed before the transport gives up.
pub(crate) const MAX_REDIRECTS: usize = 5;

pub(crate) const CAPABILITY: Capability = Capability {
    read: true,
    write: true,
    delete: true,
    list: true,
    stat: true,
    rename: true,
    copy: true,
    ..Capability::none()
};

const SCHEMA: &[OptionSpec] = &[
    OptionSpec::required("endpoint"),
    OptionSpec::optional("root"),
    OptionSpec::optional("username"),
    OptionSpec::optional("password"),
    OptionSpec::optional("insecure-skip-verify"),
];

/// Validated parameters for the webdav scheme.
///
/// `username` and `password` stay independent options: absent means
/// anonymous, present-but-empty is an empty credential, and a username
/// with no password is username-only auth. None of the three collapse
/// into each other.
#[derive(Debug, Clone)]
pub(crate) struct WebdavParams {
    pub endpoint: Url,
    pub root: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure_skip_verify: bool,
}

pub(crate) fn validate(map: &ConfigMap) -> Result<WebdavParams, ConfigError> {
    map.check_schema(SCHEMA)?;

    let endpoint = parse_endpoint(
        "endpoint",
        map.get("endpoint").unwrap_or_default(),
        &["http", "https"],
        Some(80),
    )?;

    let root_raw = map.get_or("root", "/");
    if root_raw.is_empty() {
        return Err(ConfigError::invalid("root", "must not be empty"));
    }

    Ok(WebdavParams {
        endpoint,
        root: normalize_root(root_raw),
        username: map.get("username").map(str::to_string),
        password: map.get("password").map(str::to_string),
        insecure_skip_verify: match map.get("insecure-skip-verify") {
            Some(raw) => parse_bool("insecure-skip-verify", raw)?,
            None => false,
        },
    })
}

/// Build the HTTP session state. Reachability is discovered lazily on the
/// first operation; only client construction itself can fail here.
pub(crate) fn build(params: WebdavParams) -> Result<Arc<dyn Backend>, Error> {
    Ok(Arc::new(WebdavBackend::new(params)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> ConfigMap {
        [("endpoint", "https://dav.example.com/remote.php/dav")]
            .into_iter()
            .collect()
    }

    #[test]
    fn endpoint_is_required() {
        let map = ConfigMap::new();
        assert_eq!(
            validate(&map).unwrap_err(),
            ConfigError::MissingField("endpoint".to_string())
        );
    }

    #[test]
    fn non_http_endpoint_is_rejected() {
        let map: ConfigMap = [("endpoint", "tcp://dav.example.com:80")]
            .into_iter()
            .collect();
        assert!(matches!(
            validate(&map).unwrap_err(),
            ConfigError::InvalidValue { field, .. } if field == "endpoint"
        ));
    }

    #[test]
    fn username_only_is_preserved_not_collapsed() {
        let mut map = base_map();
        map.insert("username", "foo");
        let params = validate(&map).unwrap();
        assert_eq!(params.username.as_deref(), Some("foo"));
        assert_eq!(params.password, None);

        // And the empty-password variant stays distinct from it.
        map.insert("password", "");
        let params = validate(&map).unwrap();
        assert_eq!(params.password.as_deref(), Some(""));
    }

    #[test]
    fn anonymous_when_both_credentials_absent() {
        let params = validate(&base_map()).unwrap();
        assert_eq!(params.username, None);
        assert_eq!(params.password, None);
    }

    #[test]
    fn root_defaults_and_normalizes() {
        let params = validate(&base_map()).unwrap();
        assert_eq!(params.root, "/");

        let mut map = base_map();
        map.insert("root", "/files//shared/");
        assert_eq!(validate(&map).unwrap().root, "/files/shared");
    }
}
