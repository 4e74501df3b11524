//! `relational-kv`: a relational table used as a key-value store.
//!
//! The table, key column and value column are caller-named. Both column
//! names are validated as SQL identifiers before they are ever interpolated
//! into a statement; values only ever travel through bind parameters.

mod backend;

use std::sync::Arc;

use crate::capability::Capability;
use crate::config::{parse_u32_in, ConfigMap, OptionSpec};
use crate::error::{ConfigError, Error};
use crate::operator::Backend;
use crate::path::normalize_root;

pub(crate) use backend::RelationalBackend;

pub(crate) const CAPABILITY: Capability = Capability {
    read: true,
    write: true,
    delete: true,
    list: true,
    stat: true,
    max_key_length: Some(1024),
    ..Capability::none()
};

const SCHEMA: &[OptionSpec] = &[
    OptionSpec::required("connection-string"),
    OptionSpec::required("table"),
    OptionSpec::required("key-field"),
    OptionSpec::required("value-field"),
    OptionSpec::optional("root"),
    OptionSpec::optional("max-connections"),
];

#[derive(Debug, Clone)]
pub(crate) struct RelationalParams {
    pub dsn: String,
    pub table: String,
    pub key_field: String,
    pub value_field: String,
    pub root: String,
    pub max_connections: u32,
}

fn check_identifier(field: &str, raw: &str) -> Result<(), ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if raw.len() > 64 {
        return Err(ConfigError::invalid(field, "identifier longer than 64 bytes"));
    }
    let mut chars = raw.chars();
    let first = chars.next().unwrap_or('0');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(ConfigError::invalid(
            field,
            format!("`{raw}` is not a valid SQL identifier"),
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::invalid(
            field,
            format!("`{raw}` is not a valid SQL identifier"),
        ));
    }
    Ok(())
}

pub(crate) fn validate(map: &ConfigMap) -> Result<RelationalParams, ConfigError> {
    map.check_schema(SCHEMA)?;

    let dsn = map.get("connection-string").unwrap_or_default();
    if !dsn.starts_with("sqlite:") {
        return Err(ConfigError::invalid(
            "connection-string",
            "only `sqlite:` DSNs are supported",
        ));
    }

    let table = map.get("table").unwrap_or_default();
    let key_field = map.get("key-field").unwrap_or_default();
    let value_field = map.get("value-field").unwrap_or_default();
    check_identifier("table", table)?;
    check_identifier("key-field", key_field)?;
    check_identifier("value-field", value_field)?;
    if key_field == value_field {
        return Err(ConfigError::inconsistent(
            &["key-field", "value-field"],
            "key and value must be distinct columns",
        ));
    }

    let root_raw = map.get_or("root", "/");
    if root_raw.is_empty() {
        return Err(ConfigError::invalid("root", "must not be empty"));
    }

    let max_connections = parse_u32_in("max-connections", map.get_or("max-connections", "4"), 1..=32)?;

    Ok(RelationalParams {
        dsn: dsn.to_string(),
        table: table.to_string(),
        key_field: key_field.to_string(),
        value_field: value_field.to_string(),
        root: normalize_root(root_raw),
        max_connections,
    })
}

/// Build the sqlx-backed session state. The pool is lazy: reachability of
/// the database file is discovered on the first operation.
pub(crate) fn build(params: RelationalParams) -> Result<Arc<dyn Backend>, Error> {
    Ok(Arc::new(RelationalBackend::new(params)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> ConfigMap {
        [
            ("connection-string", "sqlite::memory:"),
            ("table", "kv"),
            ("key-field", "k"),
            ("value-field", "v"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn full_map_validates() {
        let params = validate(&base_map()).unwrap();
        assert_eq!(params.table, "kv");
        assert_eq!(params.root, "/");
        assert_eq!(params.max_connections, 4);
    }

    #[test]
    fn each_required_field_is_named_when_missing() {
        for missing in ["connection-string", "table", "key-field", "value-field"] {
            let mut map = ConfigMap::new();
            for (k, v) in [
                ("connection-string", "sqlite::memory:"),
                ("table", "kv"),
                ("key-field", "k"),
                ("value-field", "v"),
            ] {
                if k != missing {
                    map.insert(k, v);
                }
            }
            assert_eq!(
                validate(&map).unwrap_err(),
                ConfigError::MissingField(missing.to_string()),
                "dropping `{missing}`"
            );
        }
    }

    #[test]
    fn non_sqlite_dsn_is_rejected() {
        let mut map = base_map();
        map.insert("connection-string", "mysql://db/kv");
        assert!(matches!(
            validate(&map).unwrap_err(),
            ConfigError::InvalidValue { field, .. } if field == "connection-string"
        ));
    }

    #[test]
    fn hostile_identifiers_are_rejected() {
        for bad in ["kv; DROP TABLE kv", "k v", "1kv", "", "k\"v"] {
            let mut map = base_map();
            map.insert("table", bad);
            assert!(
                validate(&map).is_err(),
                "identifier `{bad}` should be rejected"
            );
        }
    }

    #[test]
    fn identical_key_and_value_columns_are_inconsistent() {
        let mut map = base_map();
        map.insert("value-field", "k");
        assert!(matches!(
            validate(&map).unwrap_err(),
            ConfigError::Inconsistent { fields, .. } if fields == ["key-field", "value-field"]
        ));
    }
}
