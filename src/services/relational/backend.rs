//! sqlx-backed session state for the relational-kv scheme.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::RelationalParams;
use crate::capability::Operation;
use crate::error::{ConnectError, Error, ErrorKind, OperationError};
use crate::metadata::Metadata;
use crate::operator::{Backend, Page, Pager};

/// Statement set prepared once from the validated identifiers. Keys and
/// values only ever travel through bind parameters.
struct Statements {
    read: String,
    write: String,
    delete: String,
    stat: String,
    list: String,
}

impl Statements {
    fn new(params: &RelationalParams) -> Self {
        let table = &params.table;
        let key = &params.key_field;
        let value = &params.value_field;
        Self {
            read: format!(r#"SELECT "{value}" FROM "{table}" WHERE "{key}" = ?1"#),
            write: format!(
                r#"INSERT INTO "{table}" ("{key}", "{value}") VALUES (?1, ?2)
                   ON CONFLICT("{key}") DO UPDATE SET "{value}" = excluded."{value}""#
            ),
            delete: format!(r#"DELETE FROM "{table}" WHERE "{key}" = ?1"#),
            stat: format!(r#"SELECT length("{value}") FROM "{table}" WHERE "{key}" = ?1"#),
            // Keyset pagination in key order. The relational model has no
            // native key ordering, so the emulated list is explicitly
            // lexicographic.
            list: format!(
                r#"SELECT "{key}" FROM "{table}"
                   WHERE "{key}" > ?1 AND "{key}" LIKE ?2 ESCAPE '\'
                   ORDER BY "{key}" LIMIT ?3"#
            ),
        }
    }
}

fn translate(op: Operation, key: &str, err: sqlx::Error) -> OperationError {
    let kind = match &err {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
        sqlx::Error::PoolClosed => ErrorKind::Unavailable,
        sqlx::Error::Io(_) => ErrorKind::Unavailable,
        sqlx::Error::Database(db) => ErrorKind::Other(db.message().to_string()),
        other => ErrorKind::Other(other.to_string()),
    };
    OperationError::new(op, key, kind)
}

/// Escape LIKE metacharacters so a literal prefix matches only itself.
fn like_prefix_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

pub(crate) struct RelationalBackend {
    pool: SqlitePool,
    sql: Arc<Statements>,
}

impl RelationalBackend {
    pub(crate) fn new(params: RelationalParams) -> Result<Self, ConnectError> {
        let options =
            SqliteConnectOptions::from_str(&params.dsn).map_err(|e| ConnectError::Unreachable {
                endpoint: params.dsn.clone(),
                reason: e.to_string(),
            })?;
        let pool = SqlitePoolOptions::new()
            .max_connections(params.max_connections)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            sql: Arc::new(Statements::new(&params)),
        })
    }
}

#[async_trait]
impl Backend for RelationalBackend {
    async fn read(&self, path: &str) -> Result<Bytes, Error> {
        let row = sqlx::query(&self.sql.read)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| translate(Operation::Read, path, e))?;
        match row {
            Some(row) => {
                let value: Vec<u8> = row
                    .try_get(0)
                    .map_err(|e| translate(Operation::Read, path, e))?;
                Ok(Bytes::from(value))
            }
            None => Err(OperationError::new(Operation::Read, path, ErrorKind::NotFound).into()),
        }
    }

    async fn write(&self, path: &str, value: Bytes) -> Result<(), Error> {
        sqlx::query(&self.sql.write)
            .bind(path)
            .bind(value.to_vec())
            .execute(&self.pool)
            .await
            .map_err(|e| translate(Operation::Write, path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        // Zero affected rows is success: delete is idempotent.
        sqlx::query(&self.sql.delete)
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(|e| translate(Operation::Delete, path, e))?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Metadata, Error> {
        let row = sqlx::query(&self.sql.stat)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| translate(Operation::Stat, path, e))?;
        match row {
            Some(row) => {
                let length: Option<i64> = row
                    .try_get(0)
                    .map_err(|e| translate(Operation::Stat, path, e))?;
                Ok(Metadata::file(length.unwrap_or(0).max(0) as u64))
            }
            None => Err(OperationError::new(Operation::Stat, path, ErrorKind::NotFound).into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Pager, Error> {
        Ok(Box::new(KeysetPager {
            pool: self.pool.clone(),
            sql: self.sql.clone(),
            pattern: like_prefix_pattern(prefix),
            after: String::new(),
            page_size: super::CAPABILITY.list_page_size,
            done: false,
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pages through keys strictly greater than the last key seen, in key
/// order, so concurrent writers never make the scan loop.
struct KeysetPager {
    pool: SqlitePool,
    sql: Arc<Statements>,
    pattern: String,
    after: String,
    page_size: usize,
    done: bool,
}

#[async_trait]
impl Page for KeysetPager {
    async fn next_page(&mut self) -> Result<Option<Vec<String>>, OperationError> {
        if self.done {
            return Ok(None);
        }
        let rows = sqlx::query(&self.sql.list)
            .bind(&self.after)
            .bind(&self.pattern)
            .bind(self.page_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| translate(Operation::List, &self.pattern, e))?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row
                .try_get(0)
                .map_err(|e| translate(Operation::List, &self.pattern, e))?;
            keys.push(key);
        }
        match keys.last() {
            Some(last) => {
                self.after = last.clone();
                if keys.len() < self.page_size {
                    self.done = true;
                }
                Ok(Some(keys))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}
