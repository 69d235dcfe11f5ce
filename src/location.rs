//! Storage URLs
//!
//! A storage location is addressed as `sqlite:<path>[;<package_id>]`.
//! The distinguished path `:memory:` selects a non-persistent store; a
//! missing `;package_id` selects the default package (empty id).

use crate::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// URL of the shared in-memory storage location
pub const IN_MEMORY_URL: &str = "sqlite::memory:";

const SCHEME: &str = "sqlite:";

/// Physical location of a store: a file, or the in-memory database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoragePath {
    Memory,
    File(PathBuf),
}

impl StoragePath {
    /// Key under which the open backend for this location is cached
    pub fn cache_key(&self) -> String {
        match self {
            StoragePath::Memory => ":memory:".to_string(),
            StoragePath::File(p) => p.to_string_lossy().into_owned(),
        }
    }
}

/// A parsed storage URL: physical location plus target package id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUrl {
    pub path: StoragePath,
    pub package_id: String,
}

impl StorageUrl {
    /// Parse a `sqlite:<path>[;<package_id>]` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidUrl(format!("unknown scheme: {}", url)))?;
        let (path, package_id) = match rest.find(';') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        if path.is_empty() {
            return Err(Error::InvalidUrl(format!("empty path: {}", url)));
        }
        let path = if path == ":memory:" {
            StoragePath::Memory
        } else {
            StoragePath::File(PathBuf::from(path))
        };
        Ok(Self {
            path,
            package_id: package_id.to_string(),
        })
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.path, StoragePath::Memory)
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            StoragePath::Memory => write!(f, "{}:memory:", SCHEME)?,
            StoragePath::File(p) => write!(f, "{}{}", SCHEME, p.display())?,
        }
        if !self.package_id.is_empty() {
            write!(f, ";{}", self.package_id)?;
        }
        Ok(())
    }
}
