//! Static, per-scheme declaration of what a backend can do.

use serde::Serialize;
use std::fmt;

/// One operation of the uniform surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Delete,
    List,
    Stat,
    Rename,
    Copy,
    Presign,
    Multipart,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::List => "list",
            Operation::Stat => "stat",
            Operation::Rename => "rename",
            Operation::Copy => "copy",
            Operation::Presign => "presign",
            Operation::Multipart => "multipart",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability descriptor, shared by all operators of the same scheme.
///
/// The descriptor is fixed at registration time and never mutated per
/// instance; two operators built from the same scheme always report the
/// same capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub list: bool,
    pub stat: bool,
    pub rename: bool,
    pub copy: bool,
    pub presign: bool,
    pub multipart: bool,

    /// Longest effective backend key accepted, in bytes.
    pub max_key_length: Option<usize>,
    /// Page size used when a backend pages through listings.
    pub list_page_size: usize,
}

impl Capability {
    /// A descriptor with every operation disabled; schemes enable what they
    /// actually support on top of this.
    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
            delete: false,
            list: false,
            stat: false,
            rename: false,
            copy: false,
            presign: false,
            multipart: false,
            max_key_length: None,
            list_page_size: 128,
        }
    }

    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Delete => self.delete,
            Operation::List => self.list,
            Operation::Stat => self.stat,
            Operation::Rename => self.rename,
            Operation::Copy => self.copy,
            Operation::Presign => self.presign,
            Operation::Multipart => self.multipart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_supports_nothing() {
        let cap = Capability::none();
        for op in [
            Operation::Read,
            Operation::Write,
            Operation::Delete,
            Operation::List,
            Operation::Stat,
            Operation::Rename,
            Operation::Copy,
            Operation::Presign,
            Operation::Multipart,
        ] {
            assert!(!cap.supports(op), "{op} should be disabled");
        }
    }

    #[test]
    fn enabled_bits_are_reported() {
        let cap = Capability {
            read: true,
            stat: true,
            ..Capability::none()
        };
        assert!(cap.supports(Operation::Read));
        assert!(cap.supports(Operation::Stat));
        assert!(!cap.supports(Operation::Write));
    }
}
