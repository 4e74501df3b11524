//! The uniform handle and its capability gate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::capability::{Capability, Operation};
use crate::config::ConfigMap;
use crate::error::{CapabilityError, Error, ErrorKind, OperationError, Result};
use crate::metadata::Metadata;
use crate::path::{build_abs_path, strip_root};
use crate::scheme::Scheme;
use crate::services;

/// Backend operation surface every scheme implements against normalized
/// keys. Defaults reject operations the scheme's capability table already
/// gates out; the gate keeps them unreachable. Methods return the
/// top-level [`Error`] so a backend can report transport-level failures
/// (for example redirect exhaustion) in the connect family rather than
/// forcing them through the operation kinds.
#[async_trait]
pub(crate) trait Backend: Send + Sync + 'static {
    async fn read(&self, path: &str) -> Result<Bytes>;
    async fn write(&self, path: &str, value: Bytes) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn stat(&self, path: &str) -> Result<Metadata>;
    async fn list(&self, prefix: &str) -> Result<Pager>;

    async fn rename(&self, from: &str, _to: &str) -> Result<()> {
        Err(OperationError::new(
            Operation::Rename,
            from,
            ErrorKind::Other("not implemented by this backend".to_string()),
        )
        .into())
    }

    async fn copy(&self, from: &str, _to: &str) -> Result<()> {
        Err(OperationError::new(
            Operation::Copy,
            from,
            ErrorKind::Other("not implemented by this backend".to_string()),
        )
        .into())
    }

    /// Release pooled resources. Called at most once, by `Operator::close`.
    async fn close(&self) {}
}

/// One page of listing results.
#[async_trait]
pub(crate) trait Page: Send {
    /// Next batch of backend keys, or `None` once exhausted.
    async fn next_page(&mut self) -> std::result::Result<Option<Vec<String>>, OperationError>;
}

pub(crate) type Pager = Box<dyn Page>;

/// A page that was fully materialized up front (remote filesystems return
/// the whole directory in one response).
pub(crate) struct VecPage(pub(crate) Option<Vec<String>>);

#[async_trait]
impl Page for VecPage {
    async fn next_page(&mut self) -> std::result::Result<Option<Vec<String>>, OperationError> {
        Ok(self.0.take())
    }
}

/// Scheme, root and capabilities of a live operator.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorInfo {
    pub scheme: Scheme,
    pub root: String,
    pub capability: Capability,
}

/// The uniform handle over one backend.
///
/// Cloning is cheap and clones share the same session state; concurrent
/// calls from multiple tasks are supported. Session state is released by
/// [`close`](Operator::close); every call after that fails with
/// [`Error::Closed`].
#[derive(Clone)]
pub struct Operator {
    backend: Arc<dyn Backend>,
    scheme: Scheme,
    capability: Capability,
    root: String,
    closed: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

// The backend trait object has no `Debug` bound, so the handle describes
// itself by its identity fields.
impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("scheme", &self.scheme)
            .field("root", &self.root)
            .field("capability", &self.capability)
            .finish()
    }
}

impl Operator {
    /// Construct an operator for `scheme` from a flat config map.
    ///
    /// Dispatches to the scheme's validator and builder: configuration
    /// problems come back as [`ConfigError`](crate::ConfigError) before any
    /// I/O, transport establishment problems as
    /// [`ConnectError`](crate::ConnectError).
    pub async fn via_map(scheme: Scheme, map: ConfigMap) -> Result<Operator> {
        let (backend, root): (Arc<dyn Backend>, String) = match scheme {
            Scheme::KvPlain | Scheme::KvTls => {
                let params = services::kv::validate(scheme, &map)?;
                let root = params.root.clone();
                (services::kv::build(params).await?, root)
            }
            Scheme::RelationalKv => {
                let params = services::relational::validate(&map)?;
                let root = params.root.clone();
                (services::relational::build(params)?, root)
            }
            Scheme::Webdav => {
                let params = services::webdav::validate(&map)?;
                let root = params.root.clone();
                (services::webdav::build(params)?, root)
            }
        };
        let op = Operator::new(scheme, backend, scheme.capability(), root);
        tracing::info!(
            scheme = %scheme,
            root = %op.root,
            capability = %serde_json::to_string(&op.capability).unwrap_or_default(),
            "operator constructed"
        );
        Ok(op)
    }

    /// Convenience: build the map from any `(key, value)` iterator.
    pub async fn via_iter<I, K, V>(scheme: Scheme, iter: I) -> Result<Operator>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::via_map(scheme, map).await
    }

    pub(crate) fn new(
        scheme: Scheme,
        backend: Arc<dyn Backend>,
        capability: Capability,
        root: String,
    ) -> Self {
        Self {
            backend,
            scheme,
            capability,
            root,
            closed: Arc::new(AtomicBool::new(false)),
            timeout: None,
        }
    }

    /// Deadline applied to every network-bound call on this handle. On
    /// expiry the call fails with the `Timeout` error kind and the request
    /// is abandoned; no retry happens inside this layer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn info(&self) -> OperatorInfo {
        OperatorInfo {
            scheme: self.scheme,
            root: self.root.clone(),
            capability: self.capability,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Capability and liveness gate plus key normalization. Runs before
    /// any network interaction; an unsupported call never touches the
    /// session state.
    fn gate(&self, op: Operation, key: &str) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if !self.capability.supports(op) {
            return Err(CapabilityError::Unsupported(op).into());
        }
        let path = build_abs_path(&self.root, key);
        if let Some(limit) = self.capability.max_key_length {
            if path.len() > limit {
                return Err(CapabilityError::KeyTooLong {
                    limit,
                    actual: path.len(),
                }
                .into());
            }
        }
        Ok(path)
    }

    async fn bounded<T, F>(&self, op: Operation, path: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let out = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(out) => out,
                Err(_) => Err(OperationError::new(op, path, ErrorKind::Timeout).into()),
            },
            None => fut.await,
        };
        if let Err(err) = &out {
            tracing::warn!(scheme = %self.scheme, %err, "operation failed");
        }
        out
    }

    /// Read the whole value stored under `key`.
    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.gate(Operation::Read, key)?;
        self.bounded(Operation::Read, &path, self.backend.read(&path))
            .await
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn write(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        let path = self.gate(Operation::Write, key)?;
        self.bounded(Operation::Write, &path, self.backend.write(&path, value.into()))
            .await
    }

    /// Delete `key`. Deleting an absent key succeeds: delete is idempotent
    /// on every backend, even where the native protocol signals not-found.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.gate(Operation::Delete, key)?;
        self.bounded(Operation::Delete, &path, self.backend.delete(&path))
            .await
    }

    /// Backend metadata for `key`.
    pub async fn stat(&self, key: &str) -> Result<Metadata> {
        let path = self.gate(Operation::Stat, key)?;
        self.bounded(Operation::Stat, &path, self.backend.stat(&path))
            .await
    }

    /// List keys under `prefix`, relative to the operator root.
    ///
    /// The returned sequence is finite and not restartable: once exhausted,
    /// call `list` again for a fresh view. Ordering is backend-native —
    /// sorted for the relational emulation, protocol order for remote
    /// filesystems.
    pub async fn list(&self, prefix: &str) -> Result<Lister> {
        let path = self.gate(Operation::List, prefix)?;
        let pager = self
            .bounded(Operation::List, &path, self.backend.list(&path))
            .await?;
        Ok(Lister {
            pager,
            root: self.root.clone(),
            buffer: VecDeque::new(),
            finished: false,
            timeout: self.timeout,
        })
    }

    /// Rename `from` to `to`. Only remote filesystems support this.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.gate(Operation::Rename, from)?;
        let to_path = self.gate(Operation::Rename, to)?;
        self.bounded(
            Operation::Rename,
            &from_path,
            self.backend.rename(&from_path, &to_path),
        )
        .await
    }

    /// Server-side copy of `from` to `to`. Only remote filesystems support
    /// this.
    pub async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.gate(Operation::Copy, from)?;
        let to_path = self.gate(Operation::Copy, to)?;
        self.bounded(
            Operation::Copy,
            &from_path,
            self.backend.copy(&from_path, &to_path),
        )
        .await
    }

    /// Release the session state. Deterministic: pooled connections are
    /// dropped before this returns. A second close is a no-op.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.backend.close().await;
            tracing::info!(scheme = %self.scheme, root = %self.root, "operator closed");
        }
    }
}

/// Pull-based key listing. Finite; yields `None` forever once exhausted.
pub struct Lister {
    pager: Pager,
    root: String,
    buffer: VecDeque<String>,
    finished: bool,
    timeout: Option<Duration>,
}

impl Lister {
    /// Next key, relative to the operator root, in backend order.
    pub async fn next(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(Ok(strip_root(&self.root, &key)));
            }
            if self.finished {
                return None;
            }
            let page = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.pager.next_page()).await {
                    Ok(page) => page,
                    Err(_) => {
                        self.finished = true;
                        return Some(Err(OperationError::new(
                            Operation::List,
                            &self.root,
                            ErrorKind::Timeout,
                        )
                        .into()));
                    }
                },
                None => self.pager.next_page().await,
            };
            match page {
                Ok(Some(keys)) => self.buffer.extend(keys),
                Ok(None) => self.finished = true,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }

    /// Drain the remaining keys into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        while let Some(next) = self.next().await {
            keys.push(next?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        async fn read(&self, path: &str) -> Result<Bytes> {
            Err(OperationError::new(Operation::Read, path, ErrorKind::Unavailable).into())
        }
        async fn write(&self, _path: &str, _value: Bytes) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn stat(&self, path: &str) -> Result<Metadata> {
            Err(OperationError::new(Operation::Stat, path, ErrorKind::NotFound).into())
        }
        async fn list(&self, _prefix: &str) -> Result<Pager> {
            Ok(Box::new(VecPage(Some(vec![
                "/r/a".to_string(),
                "/r/b".to_string(),
            ]))))
        }
    }

    fn operator(capability: Capability) -> Operator {
        Operator::new(
            Scheme::KvPlain,
            Arc::new(NullBackend),
            capability,
            "/r".to_string(),
        )
    }

    #[tokio::test]
    async fn unsupported_operation_is_rejected_at_the_gate() {
        let op = operator(Capability {
            read: true,
            ..Capability::none()
        });
        let err = op.write("k", "v").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Capability(CapabilityError::Unsupported(Operation::Write))
        ));
    }

    #[tokio::test]
    async fn key_limit_is_enforced_before_dispatch() {
        let op = operator(Capability {
            read: true,
            max_key_length: Some(8),
            ..Capability::none()
        });
        let err = op.read("a-rather-long-key").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Capability(CapabilityError::KeyTooLong { limit: 8, .. })
        ));
    }

    #[tokio::test]
    async fn closed_handle_rejects_everything() {
        let op = operator(Capability {
            read: true,
            delete: true,
            ..Capability::none()
        });
        op.close().await;
        op.close().await; // double close is a no-op
        assert!(matches!(op.delete("k").await.unwrap_err(), Error::Closed));
        assert!(matches!(op.read("k").await.unwrap_err(), Error::Closed));
    }

    #[test]
    fn debug_output_names_scheme_and_root() {
        let op = operator(Capability {
            read: true,
            ..Capability::none()
        });
        let rendered = format!("{op:?}");
        assert!(rendered.contains("KvPlain"));
        assert!(rendered.contains("/r"));
    }

    #[tokio::test]
    async fn lister_strips_the_root_and_is_finite() {
        let op = operator(Capability {
            list: true,
            ..Capability::none()
        });
        let mut lister = op.list("").await.unwrap();
        assert_eq!(lister.next().await.unwrap().unwrap(), "/a");
        assert_eq!(lister.next().await.unwrap().unwrap(), "/b");
        assert!(lister.next().await.is_none());
        // Exhausted listers stay exhausted.
        assert!(lister.next().await.is_none());
    }
}
