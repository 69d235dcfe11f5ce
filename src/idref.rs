//! Element references
//!
//! An *id-ref* identifies an element from the point of view of a package:
//! either `localId` (an element owned by the package itself) or
//! `importId:localId` (an element reached through one of the package's
//! `Import` elements). Reference depth is always ≤ 2 - an id-ref never
//! chains through two imports.
//!
//! A *uri-ref* is the absolute form `uri#fragment` an id-ref resolves to,
//! used when comparing references across packages that may alias the same
//! import under different local names.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A possibly two-level reference to an element.
///
/// Parsed and validated once at the boundary; the variants are matched
/// directly downstream, never re-split.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdRef {
    /// An element owned by the referencing package
    Own(String),
    /// An element reached through an `Import` element of the package
    Imported {
        /// Local id of the `Import` element
        import: String,
        /// Id of the element in the imported package
        id: String,
    },
}

impl IdRef {
    /// Create a reference to an own element
    pub fn own(id: impl Into<String>) -> Self {
        IdRef::Own(id.into())
    }

    /// Create a reference through an import
    pub fn imported(import: impl Into<String>, id: impl Into<String>) -> Self {
        IdRef::Imported {
            import: import.into(),
            id: id.into(),
        }
    }

    /// Parse an id-ref string (`local` or `import:local`).
    ///
    /// Fails on empty input and on references deeper than 2 levels.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidReference("empty id-ref".to_string()));
        }
        match s.split_once(':') {
            None => Ok(IdRef::Own(s.to_string())),
            Some((prefix, suffix)) => {
                if prefix.is_empty() {
                    return Err(Error::InvalidReference(format!("empty import prefix: {}", s)));
                }
                if suffix.is_empty() || suffix.contains(':') {
                    return Err(Error::InvalidReference(format!(
                        "id-ref has depth > 2: {}",
                        s
                    )));
                }
                Ok(IdRef::Imported {
                    import: prefix.to_string(),
                    id: suffix.to_string(),
                })
            }
        }
    }

    /// Rebuild a reference from its two stored columns.
    ///
    /// An empty prefix means an own element.
    pub fn from_columns(prefix: String, id: String) -> Self {
        if prefix.is_empty() {
            IdRef::Own(id)
        } else {
            IdRef::Imported { import: prefix, id }
        }
    }

    /// The import prefix column value (empty string for own elements)
    pub fn prefix(&self) -> &str {
        match self {
            IdRef::Own(_) => "",
            IdRef::Imported { import, .. } => import,
        }
    }

    /// The local id column value
    pub fn local_id(&self) -> &str {
        match self {
            IdRef::Own(id) => id,
            IdRef::Imported { id, .. } => id,
        }
    }

    /// Does this reference go through an import?
    pub fn is_imported(&self) -> bool {
        matches!(self, IdRef::Imported { .. })
    }
}

impl fmt::Display for IdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdRef::Own(id) => write!(f, "{}", id),
            IdRef::Imported { import, id } => write!(f, "{}:{}", import, id),
        }
    }
}

impl FromStr for IdRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for IdRef {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IdRef {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        IdRef::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The absolute, package-independent form of an id-ref: `uri#fragment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UriRef {
    /// URI of the owning package (or of the import target)
    pub uri: String,
    /// Local id of the element inside that package
    pub fragment: String,
}

impl UriRef {
    /// Build a uri-ref from its parts
    pub fn new(uri: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            fragment: fragment.into(),
        }
    }

    /// Parse a `uri#fragment` string.
    ///
    /// The fragment separator is the *last* `#`, so package URIs may
    /// themselves contain one.
    pub fn parse(s: &str) -> Result<Self> {
        let sharp = s
            .rfind('#')
            .ok_or_else(|| Error::InvalidReference(format!("uri-ref without fragment: {}", s)))?;
        Ok(Self {
            uri: s[..sharp].to_string(),
            fragment: s[sharp + 1..].to_string(),
        })
    }
}

impl fmt::Display for UriRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uri, self.fragment)
    }
}

impl FromStr for UriRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
