//! Metadata returned by `stat`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Whether an entry is a file-like object or a directory marker.
///
/// Key-value backends only ever report `File`; remote filesystems report
/// both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryMode {
    File,
    Dir,
}

impl EntryMode {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryMode::Dir)
    }
}

/// Backend-reported metadata for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub mode: EntryMode,
    /// Value size in bytes. Zero for directory markers.
    pub content_length: u64,
    /// Last modification time, if the backend tracks one. Key-value
    /// backends do not.
    pub last_modified: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn file(content_length: u64) -> Self {
        Self {
            mode: EntryMode::File,
            content_length,
            last_modified: None,
        }
    }

    pub fn dir() -> Self {
        Self {
            mode: EntryMode::Dir,
            content_length: 0,
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, t: DateTime<Utc>) -> Self {
        self.last_modified = Some(t);
        self
    }
}
