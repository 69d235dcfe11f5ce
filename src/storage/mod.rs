//! Storage Layer - SQLite-backed package persistence
//!
//! Logical relations, shared by any concrete encoding:
//! - Packages(id, uri, url)
//! - Elements(package, id, typ)
//! - Medias / Annotations / Imports (per-kind detail tables)
//! - Contents(package, element, mimetype, data, schema)
//! - Meta(package, element, key, value)
//! - RelationMembers / ListItems (dense positional indices)
//! - Tagged(package, element, tag)

pub mod iter;
pub mod schema;
pub mod sqlite;

pub use iter::FlushableIter;
pub use sqlite::{SqliteBackend, StoreStats, TxnMode};
