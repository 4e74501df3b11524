//! Error taxonomy of the construction and operation surface.
//!
//! Three failure families exist, and they never mix: [`ConfigError`] is
//! local and detected before any I/O, [`ConnectError`] covers transport
//! establishment and may be transient, and [`OperationError`] carries the
//! closed set of translated backend failures. Capability rejections are
//! permanent for a given scheme and get their own family so callers never
//! retry them.

use std::fmt;

use thiserror::Error;

use crate::capability::Operation;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error returned by every public entry point.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// The operator handle was closed; the session state is gone.
    #[error("operator handle is closed")]
    Closed,
}

impl Error {
    /// Translated kind of a backend-reported failure, if this is one.
    pub fn operation_kind(&self) -> Option<&ErrorKind> {
        match self {
            Error::Operation(e) => Some(&e.kind),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.operation_kind(), Some(ErrorKind::NotFound))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Capability(CapabilityError::Unsupported(_)))
    }
}

/// Configuration problems, always detected before any I/O and always
/// recoverable by correcting the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required key is absent from the config map.
    #[error("missing required config field `{0}`")]
    MissingField(String),
    /// A key is present but its value does not parse or is out of range.
    #[error("invalid value for config field `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
    /// Two or more fields are individually valid but contradict each other.
    #[error("inconsistent config fields {fields:?}: {reason}")]
    Inconsistent {
        fields: Vec<String>,
        reason: String,
    },
    /// Strict mode only: a key the scheme does not recognize.
    #[error("unknown config field `{0}`")]
    UnknownField(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn inconsistent(fields: &[&str], reason: impl Into<String>) -> Self {
        ConfigError::Inconsistent {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            reason: reason.into(),
        }
    }
}

/// Transport establishment failures. `Timeout` and `Refused` are the
/// transient half of the family; `Handshake` is permanent until the
/// endpoint or its certificates change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("handshake with `{endpoint}` failed: {reason}")]
    Handshake { endpoint: String, reason: String },
    #[error("too many redirects contacting `{endpoint}` (limit {limit})")]
    TooManyRedirects { endpoint: String, limit: usize },
    #[error("timed out connecting to `{endpoint}`")]
    Timeout { endpoint: String },
    #[error("connection to `{endpoint}` refused")]
    Refused { endpoint: String },
    #[error("endpoint `{endpoint}` unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
}

/// Rejections issued by the capability gate, before any network
/// interaction. Permanent for a given scheme.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("operation `{0}` is not supported by this backend")]
    Unsupported(Operation),
    #[error("key length {actual} exceeds the backend limit of {limit} bytes")]
    KeyTooLong { limit: usize, actual: usize },
}

/// The closed set backend failures are translated into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    Timeout,
    Unavailable,
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => f.write_str("not found"),
            ErrorKind::PermissionDenied => f.write_str("permission denied"),
            ErrorKind::AlreadyExists => f.write_str("already exists"),
            ErrorKind::Timeout => f.write_str("timed out"),
            ErrorKind::Unavailable => f.write_str("backend unavailable"),
            ErrorKind::Other(detail) => write!(f, "{detail}"),
        }
    }
}

/// One failed operation, naming the operation, the effective key and the
/// translated kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} `{key}` failed: {kind}")]
pub struct OperationError {
    pub op: Operation,
    pub key: String,
    pub kind: ErrorKind,
}

impl OperationError {
    pub(crate) fn new(op: Operation, key: &str, kind: ErrorKind) -> Self {
        Self {
            op,
            key: key.to_string(),
            kind,
        }
    }
}
