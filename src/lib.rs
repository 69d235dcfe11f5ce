//! # Annex - Package storage backend
//!
//! Persistence core of the Annex video annotation platform.
//!
//! Annex stores a graph of typed, identified elements (medias, annotations,
//! relations, views, resources, tags, lists, queries, imports) grouped into
//! named *packages* inside a single storage location. This crate provides:
//! - URL-based backend dispatch (`claims_for_create` / `claims_for_bind`)
//!   with a process-wide cache of open storage locations
//! - Atomic create/read/update/delete/rename for every element kind, plus
//!   per-element content and metadata
//! - Ordered collections (relation members, list items) with dense,
//!   gap-free positional indices
//! - Many-to-many element/tag associations
//! - Two-level reference resolution across package imports, and rename
//!   propagation to every dependent reference
//! - Result iterators that stay consistent across subsequent mutations

pub mod config;
pub mod element;
pub mod idref;
pub mod location;
pub mod registry;
pub mod storage;

// Re-exports for convenient access
pub use element::{Element, ElementData, ElementType};
pub use idref::{IdRef, UriRef};
pub use location::{StorageUrl, IN_MEMORY_URL};
pub use registry::{bind, claims_for_bind, claims_for_create, create, PackageHandle, PackageRef};
pub use storage::SqliteBackend;

/// Result type alias for Annex operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Annex operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An element with this id already exists in the package
    #[error("id in use: {0}")]
    IdInUse(String),

    /// The target package is already bound; carries the current owner's URL
    #[error("package in use: {0}")]
    PackageInUse(String),

    /// The requested package does not exist in the storage location
    #[error("no such package: {0}")]
    NoSuchPackage(String),

    /// A reference string could not be parsed (e.g. id-ref deeper than 2)
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A storage URL could not be parsed or is not claimed by this backend
    #[error("invalid storage url: {0}")]
    InvalidUrl(String),

    /// The `force` flag is not supported by this backend
    #[error("force is not supported by this backend")]
    ForceUnsupported,

    /// Underlying storage failure; the enclosing transaction was rolled back
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
