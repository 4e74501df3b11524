//! Pooled connection backend for the kv schemes.
//!
//! The pool is a checkout/checkin stack: a connection is owned exclusively
//! by one in-flight call, then returned if the idle stack has room.
//! Connections that hit an I/O error are dropped, never reused.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::resp::{encode_command, read_reply, Reply};
use super::KvParams;
use crate::capability::Operation;
use crate::error::{ConnectError, Error, ErrorKind, OperationError};
use crate::metadata::Metadata;
use crate::operator::{Backend, Page, Pager};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// One framed connection, already authenticated and switched to the
/// configured database index.
struct KvConnection {
    io: BufReader<Box<dyn IoStream>>,
}

impl KvConnection {
    fn new(stream: Box<dyn IoStream>) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    async fn command(&mut self, args: &[&[u8]]) -> io::Result<Reply> {
        self.io.get_mut().write_all(&encode_command(args)).await?;
        self.io.get_mut().flush().await?;
        read_reply(&mut self.io).await
    }
}

/// Dial failures, before a connection ever served an operation.
enum DialError {
    Refused,
    Timeout,
    Handshake(String),
    Io(String),
}

pub(crate) struct KvPool {
    params: KvParams,
    idle: Mutex<Vec<KvConnection>>,
    dials: AtomicU64,
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl KvPool {
    fn new(params: KvParams) -> Result<Self, ConnectError> {
        let tls = if params.use_tls {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(params.insecure_skip_verify)
                .build()
                .map_err(|e| ConnectError::Handshake {
                    endpoint: format!("{}:{}", params.host, params.port),
                    reason: format!("TLS context initialization failed: {e}"),
                })?;
            Some(tokio_native_tls::TlsConnector::from(connector))
        } else {
            None
        };
        Ok(Self {
            params,
            idle: Mutex::new(Vec::new()),
            dials: AtomicU64::new(0),
            tls,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.params.host, self.params.port)
    }

    /// Number of dial attempts made so far. Lets tests verify that gated
    /// operations never touch the network.
    pub(crate) fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    async fn dial(&self) -> Result<KvConnection, DialError> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(endpoint = %self.endpoint(), tls = self.params.use_tls, "dialing kv backend");

        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.params.host.as_str(), self.params.port)),
        )
        .await
        .map_err(|_| DialError::Timeout)?
        .map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused,
            io::ErrorKind::TimedOut => DialError::Timeout,
            _ => DialError::Io(e.to_string()),
        })?;
        tcp.set_nodelay(true).ok();

        let stream: Box<dyn IoStream> = match &self.tls {
            Some(connector) => {
                let tls = connector
                    .connect(&self.params.host, tcp)
                    .await
                    .map_err(|e| DialError::Handshake(e.to_string()))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let mut conn = KvConnection::new(stream);
        self.login(&mut conn).await?;
        Ok(conn)
    }

    /// Post-connect handshake: AUTH when credentials are configured, then
    /// SELECT for non-default database indices.
    async fn login(&self, conn: &mut KvConnection) -> Result<(), DialError> {
        if let Some(password) = &self.params.password {
            let reply = match &self.params.username {
                Some(username) => {
                    conn.command(&[b"AUTH", username.as_bytes(), password.as_bytes()])
                        .await
                }
                None => conn.command(&[b"AUTH", password.as_bytes()]).await,
            }
            .map_err(|e| DialError::Io(e.to_string()))?;
            if let Reply::Error(msg) = reply {
                return Err(DialError::Handshake(format!("authentication rejected: {msg}")));
            }
        }
        if self.params.db != 0 {
            let db = self.params.db.to_string();
            let reply = conn
                .command(&[b"SELECT", db.as_bytes()])
                .await
                .map_err(|e| DialError::Io(e.to_string()))?;
            if let Reply::Error(msg) = reply {
                return Err(DialError::Handshake(format!("database select rejected: {msg}")));
            }
        }
        Ok(())
    }

    async fn checkout(&self) -> Result<KvConnection, DialError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        self.dial().await
    }

    fn checkin(&self, conn: KvConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.params.pool_size {
            idle.push(conn);
        }
    }

    fn clear(&self) {
        self.idle.lock().clear();
    }
}

fn dial_error_kind(err: DialError) -> ErrorKind {
    match err {
        DialError::Refused => ErrorKind::Unavailable,
        DialError::Timeout => ErrorKind::Timeout,
        DialError::Handshake(_) => ErrorKind::PermissionDenied,
        DialError::Io(detail) => ErrorKind::Other(detail),
    }
}

/// Translate a server `-ERR`-style reply into the closed error kind set.
fn server_error_kind(msg: &str) -> ErrorKind {
    let upper = msg.to_ascii_uppercase();
    if upper.starts_with("NOAUTH") || upper.starts_with("WRONGPASS") || upper.starts_with("NOPERM")
    {
        ErrorKind::PermissionDenied
    } else {
        ErrorKind::Other(msg.to_string())
    }
}

/// Escape glob metacharacters so a literal key prefix matches only itself.
fn escape_match_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

pub(crate) struct KvBackend {
    pool: Arc<KvPool>,
}

impl KvBackend {
    pub(crate) fn new(params: KvParams) -> Result<Self, ConnectError> {
        Ok(Self {
            pool: Arc::new(KvPool::new(params)?),
        })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> Arc<KvPool> {
        self.pool.clone()
    }

    /// TLS builds are verified eagerly so certificate and credential
    /// problems surface at construction; plain TCP stays lazy.
    pub(crate) async fn verify_handshake_if_tls(&self) -> Result<(), ConnectError> {
        if !self.pool.params.use_tls {
            return Ok(());
        }
        let endpoint = self.pool.endpoint();
        let conn = self.pool.dial().await.map_err(|e| match e {
            DialError::Refused => ConnectError::Refused { endpoint: endpoint.clone() },
            DialError::Timeout => ConnectError::Timeout { endpoint: endpoint.clone() },
            DialError::Handshake(reason) => ConnectError::Handshake {
                endpoint: endpoint.clone(),
                reason,
            },
            DialError::Io(reason) => ConnectError::Unreachable {
                endpoint: endpoint.clone(),
                reason,
            },
        })?;
        self.pool.checkin(conn);
        Ok(())
    }

    /// Run one command on a pooled connection. Protocol-level error replies
    /// keep the connection; I/O failures discard it.
    async fn run(&self, op: Operation, key: &str, args: &[&[u8]]) -> Result<Reply, OperationError> {
        let mut conn = self
            .pool
            .checkout()
            .await
            .map_err(|e| OperationError::new(op, key, dial_error_kind(e)))?;
        match conn.command(args).await {
            Ok(Reply::Error(msg)) => {
                self.pool.checkin(conn);
                Err(OperationError::new(op, key, server_error_kind(&msg)))
            }
            Ok(reply) => {
                self.pool.checkin(conn);
                Ok(reply)
            }
            Err(e) => Err(OperationError::new(
                op,
                key,
                ErrorKind::Other(format!("connection failed mid-command: {e}")),
            )),
        }
    }
}

#[async_trait]
impl Backend for KvBackend {
    async fn read(&self, path: &str) -> Result<Bytes, Error> {
        match self.run(Operation::Read, path, &[b"GET", path.as_bytes()]).await? {
            Reply::Bulk(Some(data)) => Ok(Bytes::from(data)),
            Reply::Bulk(None) => {
                Err(OperationError::new(Operation::Read, path, ErrorKind::NotFound).into())
            }
            other => Err(OperationError::new(
                Operation::Read,
                path,
                ErrorKind::Other(format!("unexpected reply {other:?}")),
            )
            .into()),
        }
    }

    async fn write(&self, path: &str, value: Bytes) -> Result<(), Error> {
        match self
            .run(Operation::Write, path, &[b"SET", path.as_bytes(), &value])
            .await?
        {
            Reply::Simple(s) if s == "OK" => Ok(()),
            other => Err(OperationError::new(
                Operation::Write,
                path,
                ErrorKind::Other(format!("unexpected reply {other:?}")),
            )
            .into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        // DEL reports how many keys existed; zero is still success, which
        // gives delete its idempotence guarantee.
        match self.run(Operation::Delete, path, &[b"DEL", path.as_bytes()]).await? {
            Reply::Integer(_) => Ok(()),
            other => Err(OperationError::new(
                Operation::Delete,
                path,
                ErrorKind::Other(format!("unexpected reply {other:?}")),
            )
            .into()),
        }
    }

    async fn stat(&self, path: &str) -> Result<Metadata, Error> {
        let mut conn = self
            .pool
            .checkout()
            .await
            .map_err(|e| OperationError::new(Operation::Stat, path, dial_error_kind(e)))?;
        let result: Result<Option<Reply>, io::Error> = async {
            let exists = conn.command(&[b"EXISTS", path.as_bytes()]).await?;
            if matches!(exists, Reply::Integer(0)) {
                return Ok(None);
            }
            let len = conn.command(&[b"STRLEN", path.as_bytes()]).await?;
            Ok(Some(len))
        }
        .await;
        match result {
            Ok(None) => {
                self.pool.checkin(conn);
                Err(OperationError::new(Operation::Stat, path, ErrorKind::NotFound).into())
            }
            Ok(Some(Reply::Integer(n))) => {
                self.pool.checkin(conn);
                Ok(Metadata::file(n.max(0) as u64))
            }
            Ok(Some(Reply::Error(msg))) => {
                self.pool.checkin(conn);
                Err(OperationError::new(Operation::Stat, path, server_error_kind(&msg)).into())
            }
            Ok(Some(other)) => {
                self.pool.checkin(conn);
                Err(OperationError::new(
                    Operation::Stat,
                    path,
                    ErrorKind::Other(format!("unexpected reply {other:?}")),
                )
                .into())
            }
            Err(e) => Err(OperationError::new(
                Operation::Stat,
                path,
                ErrorKind::Other(format!("connection failed mid-command: {e}")),
            )
            .into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Pager, Error> {
        Ok(Box::new(ScanPager {
            pool: self.pool.clone(),
            pattern: escape_match_pattern(prefix),
            cursor: Some("0".to_string()),
            page_size: super::CAPABILITY.list_page_size,
        }))
    }

    async fn close(&self) {
        self.pool.clear();
    }
}

/// Cursor-driven key scan. Each page issues one SCAN round trip; the scan
/// is finished when the server hands back cursor zero.
struct ScanPager {
    pool: Arc<KvPool>,
    pattern: String,
    cursor: Option<String>,
    page_size: usize,
}

#[async_trait]
impl Page for ScanPager {
    async fn next_page(&mut self) -> Result<Option<Vec<String>>, OperationError> {
        let cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => return Ok(None),
        };
        let count = self.page_size.to_string();
        let mut conn = self
            .pool
            .checkout()
            .await
            .map_err(|e| OperationError::new(Operation::List, &self.pattern, dial_error_kind(e)))?;
        let reply = conn
            .command(&[
                b"SCAN",
                cursor.as_bytes(),
                b"MATCH",
                self.pattern.as_bytes(),
                b"COUNT",
                count.as_bytes(),
            ])
            .await
            .map_err(|e| {
                OperationError::new(
                    Operation::List,
                    &self.pattern,
                    ErrorKind::Other(format!("connection failed mid-command: {e}")),
                )
            })?;
        self.pool.checkin(conn);

        let malformed = || {
            OperationError::new(
                Operation::List,
                &self.pattern,
                ErrorKind::Other("unexpected scan reply shape".to_string()),
            )
        };
        match reply {
            Reply::Error(msg) => Err(OperationError::new(
                Operation::List,
                &self.pattern,
                server_error_kind(&msg),
            )),
            Reply::Array(Some(items)) if items.len() == 2 => {
                let mut items = items.into_iter();
                let next_cursor = match items.next() {
                    Some(Reply::Bulk(Some(raw))) => {
                        String::from_utf8(raw).map_err(|_| malformed())?
                    }
                    _ => return Err(malformed()),
                };
                let keys = match items.next() {
                    Some(Reply::Array(Some(entries))) => entries
                        .into_iter()
                        .map(|entry| match entry {
                            Reply::Bulk(Some(raw)) => {
                                String::from_utf8(raw).map_err(|_| malformed())
                            }
                            _ => Err(malformed()),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(malformed()),
                };
                if next_cursor != "0" {
                    self.cursor = Some(next_cursor);
                }
                Ok(Some(keys))
            }
            _ => Err(malformed()),
        }
    }
}
