//! Uniform, capability-gated access to heterogeneous storage backends.
//!
//! Every backend is addressed through the same three concepts:
//!
//! - [`Scheme`]: the closed registry of supported backend kinds.
//! - [`ConfigMap`]: flat string configuration, the sole input format.
//! - [`Operator`]: the uniform handle exposing read/write/delete/list/stat,
//!   gated by the scheme's static [`Capability`] descriptor.
//!
//! ```text
//! ┌───────────┐  validate   ┌──────────────┐  build   ┌──────────┐
//! │ ConfigMap ├────────────►│ typed params ├─────────►│ Operator │
//! └───────────┘  (per       └──────────────┘ (session │          │
//!                 scheme)                     state)   └──────────┘
//! ```
//!
//! Construction is strict: configuration problems surface as field-level
//! [`ConfigError`]s before any I/O, unsupported operations are rejected by
//! the capability gate before any network interaction, and backend failures
//! are translated into the small closed [`ErrorKind`] set.

pub mod capability;
pub mod config;
pub mod error;
pub mod metadata;
pub mod operator;
pub mod scheme;

mod path;
mod services;

pub use capability::{Capability, Operation};
pub use config::ConfigMap;
pub use error::{
    CapabilityError, ConfigError, ConnectError, Error, ErrorKind, OperationError, Result,
};
pub use metadata::{EntryMode, Metadata};
pub use operator::{Lister, Operator, OperatorInfo};
pub use scheme::Scheme;
