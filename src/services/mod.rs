//! Per-scheme validators, builders and backends.

pub(crate) mod kv;
pub(crate) mod relational;
pub(crate) mod webdav;
