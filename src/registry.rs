//! Backend registry and lifecycle
//!
//! URL-based dispatch deciding whether this backend can *create* a new
//! package or *bind* to an existing one, plus a process-wide cache of open
//! backends keyed by storage location: at most one live [`SqliteBackend`]
//! exists per location, shared by every package bound to it.
//!
//! Ownership is explicit. [`create`] and [`bind`] return a
//! [`PackageHandle`] holding a strong reference to the backend; dropping
//! the handle (or calling [`PackageHandle::close`]) unbinds the package,
//! and the backend releases its physical connection when the last package
//! is unbound. The cache only holds weak references and never keeps a
//! connection alive by itself.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::location::{StoragePath, StorageUrl};
use crate::storage::schema::{all_schema_statements, BACKEND_VERSION};
use crate::storage::SqliteBackend;
use crate::{Error, Result};

static CACHE: OnceLock<Mutex<HashMap<String, Weak<SqliteBackend>>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<String, Weak<SqliteBackend>>> {
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cached_backend(key: &str) -> Option<Arc<SqliteBackend>> {
    let cache = cache().lock().expect("backend cache poisoned");
    cache
        .get(key)
        .and_then(Weak::upgrade)
        .filter(|b| !b.is_closed())
}

/// Drop a cache entry once its backend is closed or gone.
pub(crate) fn evict(path: &StoragePath) {
    let mut cache = cache().lock().expect("backend cache poisoned");
    let key = path.cache_key();
    let dead = match cache.get(&key).map(Weak::upgrade) {
        Some(Some(backend)) => backend.is_closed(),
        Some(None) => true,
        None => false,
    };
    if dead {
        cache.remove(&key);
    }
}

/// The owner a package is bound for: the model-layer package object,
/// reduced to the URL it is known under. The URL is recorded on bind and
/// reported inside [`Error::PackageInUse`].
#[derive(Debug, Clone)]
pub struct PackageRef {
    pub url: String,
}

impl PackageRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// A package bound to a backend.
///
/// Closing is explicit ([`PackageHandle::close`]); if the handle is
/// dropped without closing, the binding is released anyway.
#[derive(Debug)]
pub struct PackageHandle {
    backend: Arc<SqliteBackend>,
    package_id: String,
    closed: bool,
}

impl PackageHandle {
    fn new(backend: Arc<SqliteBackend>, package_id: String) -> Self {
        Self {
            backend,
            package_id,
            closed: false,
        }
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    /// Unbind the package. After the last bound package of a location is
    /// closed, its backend releases the physical connection.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.backend.close(&self.package_id)
    }
}

impl Drop for PackageHandle {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.backend.close(&self.package_id) {
                tracing::warn!("error closing package {:?}: {}", self.package_id, e);
            }
        }
    }
}

/// Is this backend able to create a package at the given URL?
///
/// Checks that the URL is compatible with this backend and that the
/// target does not already hold the requested package.
pub fn claims_for_create(url: &str) -> bool {
    let Ok(parsed) = StorageUrl::parse(url) else {
        return false;
    };
    match &parsed.path {
        StoragePath::Memory => true,
        StoragePath::File(path) => {
            if !path.exists() {
                // the file can be created iff its directory exists
                match path.parent() {
                    Some(dir) if dir.as_os_str().is_empty() => true,
                    Some(dir) => dir.is_dir(),
                    None => false,
                }
            } else {
                match open_checked(path) {
                    Some(conn) => !connection_contains(&conn, &parsed.package_id),
                    None => false,
                }
            }
        }
    }
}

/// Is this backend able to bind to the given URL?
pub fn claims_for_bind(url: &str) -> bool {
    let Ok(parsed) = StorageUrl::parse(url) else {
        return false;
    };
    match &parsed.path {
        StoragePath::Memory => match cached_backend(":memory:") {
            // the in-memory store only exists while a backend holds it
            Some(backend) => backend.contains_package(&parsed.package_id).unwrap_or(false),
            None => false,
        },
        StoragePath::File(path) => {
            if !path.exists() {
                return false;
            }
            match open_checked(path) {
                Some(conn) => connection_contains(&conn, &parsed.package_id),
                None => false,
            }
        }
    }
}

/// Create a new package and bind it to `package`.
///
/// Returns a handle over the (possibly shared) backend for the location.
/// Fails with [`Error::PackageInUse`] if a package with that id is already
/// bound or physically present. `force` is not supported and fails
/// explicitly. On first use of a location the physical store is
/// initialized and stamped with the backend version.
pub fn create(package: &PackageRef, force: bool, url: Option<&str>) -> Result<PackageHandle> {
    let url = url.unwrap_or(&package.url);
    assert!(claims_for_create(url), "backend does not claim url: {}", url);
    if force {
        return Err(Error::ForceUnsupported);
    }
    let parsed = StorageUrl::parse(url)?;
    let key = parsed.path.cache_key();

    let mut cache = cache().lock().expect("backend cache poisoned");
    let cached = cache.get(&key).and_then(Weak::upgrade).filter(|b| !b.is_closed());
    let (backend, fresh) = match cached {
        Some(backend) => (backend, false),
        None => {
            let (conn, fresh) = open_location(&parsed.path)?;
            let backend = Arc::new(SqliteBackend::new(parsed.path.clone(), conn));
            cache.insert(key, Arc::downgrade(&backend));
            (backend, fresh)
        }
    };
    backend.bind_package(&parsed.package_id, &package.url, true, fresh)?;
    tracing::debug!("created package {:?} at {}", parsed.package_id, url);
    Ok(PackageHandle::new(backend, parsed.package_id))
}

/// Bind an existing package to `package`.
///
/// Fails with [`Error::PackageInUse`] (carrying the current owner's URL)
/// if the package is already bound elsewhere. `force` is not supported.
pub fn bind(package: &PackageRef, force: bool, url: Option<&str>) -> Result<PackageHandle> {
    let url = url.unwrap_or(&package.url);
    assert!(claims_for_bind(url), "backend does not claim url: {}", url);
    if force {
        return Err(Error::ForceUnsupported);
    }
    let parsed = StorageUrl::parse(url)?;
    let key = parsed.path.cache_key();

    let mut cache = cache().lock().expect("backend cache poisoned");
    let cached = cache.get(&key).and_then(Weak::upgrade).filter(|b| !b.is_closed());
    let backend = match cached {
        Some(backend) => backend,
        None => match &parsed.path {
            StoragePath::Memory => {
                return Err(Error::NoSuchPackage(parsed.package_id));
            }
            StoragePath::File(path) => {
                let conn = Connection::open(path)?;
                let backend = Arc::new(SqliteBackend::new(parsed.path.clone(), conn));
                cache.insert(key, Arc::downgrade(&backend));
                backend
            }
        },
    };
    backend.bind_package(&parsed.package_id, &package.url, false, false)?;
    tracing::debug!("bound package {:?} at {}", parsed.package_id, url);
    Ok(PackageHandle::new(backend, parsed.package_id))
}

/// Open (and if needed initialize) the physical store.
/// Returns the connection and whether it was freshly initialized.
fn open_location(path: &StoragePath) -> Result<(Connection, bool)> {
    match path {
        StoragePath::Memory => {
            let conn = Connection::open_in_memory()?;
            init_store(&conn)?;
            Ok((conn, true))
        }
        StoragePath::File(p) => {
            let must_init = !p.exists();
            let conn = Connection::open(p)?;
            if must_init {
                init_store(&conn)?;
            }
            Ok((conn, must_init))
        }
    }
}

/// Write the schema, the version stamp and the default package row.
fn init_store(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN EXCLUSIVE")?;
    let res = (|| -> Result<()> {
        for stmt in all_schema_statements() {
            conn.execute(stmt, [])?;
        }
        conn.execute(
            "INSERT INTO Version (version) VALUES (?1)",
            params![BACKEND_VERSION],
        )?;
        conn.execute("INSERT INTO Packages (id, uri, url) VALUES ('', '', '')", [])?;
        Ok(())
    })();
    match res {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Open a file and verify it is a store created by this backend, with a
/// matching version stamp.
fn open_checked(path: &Path) -> Option<Connection> {
    let conn = Connection::open(path).ok()?;
    let version: String = conn
        .query_row("SELECT version FROM Version", [], |row| row.get(0))
        .ok()?;
    (version == BACKEND_VERSION).then_some(conn)
}

fn connection_contains(conn: &Connection, package_id: &str) -> bool {
    conn.query_row(
        "SELECT id FROM Packages WHERE id = ?1",
        params![package_id],
        |_| Ok(()),
    )
    .optional()
    .ok()
    .flatten()
    .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IN_MEMORY_URL;
    use tempfile::TempDir;

    fn file_url(dir: &TempDir, pkg: &str) -> String {
        let path = dir.path().join("db");
        if pkg.is_empty() {
            format!("sqlite:{}", path.display())
        } else {
            format!("sqlite:{};{}", path.display(), pkg)
        }
    }

    #[test]
    fn test_claims_wrong_scheme() {
        assert!(!claims_for_create("http://example.com/annex/db"));
        assert!(!claims_for_bind("http://example.com/annex/db"));
    }

    #[test]
    fn test_claims_missing_directory() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}/sub/db", dir.path().display());
        assert!(!claims_for_create(&url));
    }

    #[test]
    fn test_claims_new_file() {
        let dir = TempDir::new().unwrap();
        assert!(claims_for_create(&file_url(&dir, "")));
        assert!(claims_for_create(&file_url(&dir, "foo")));
        // nothing to bind to yet
        assert!(!claims_for_bind(&file_url(&dir, "")));
    }

    #[test]
    fn test_claims_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE a (b)", []).unwrap();
        drop(conn);
        assert!(!claims_for_create(&file_url(&dir, "")));
        assert!(!claims_for_bind(&file_url(&dir, "")));
    }

    #[test]
    fn test_claims_existing_package() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "foo");
        let h = create(&PackageRef::new(&url), false, None).unwrap();
        h.close().unwrap();
        assert!(!claims_for_create(&url));
        assert!(claims_for_create(&file_url(&dir, "bar")));
        assert!(claims_for_bind(&url));
        assert!(!claims_for_bind(&file_url(&dir, "bar")));
    }

    #[test]
    fn test_create_then_bind() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "");
        let h = create(&PackageRef::new(&url), false, None).unwrap();
        assert_eq!(h.package_id(), "");
        h.close().unwrap();

        let h = bind(&PackageRef::new(&url), false, None).unwrap();
        assert_eq!(h.package_id(), "");
        h.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "does not claim")]
    fn test_create_existing_package_is_contract_violation() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "foo");
        let h = create(&PackageRef::new(&url), false, None).unwrap();
        h.close().unwrap();
        assert!(!claims_for_create(&url));
        let _ = create(&PackageRef::new(&url), false, None);
    }

    #[test]
    fn test_double_bind_reports_owner() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "");
        let first = PackageRef::new(&url);
        let h1 = create(&first, false, None).unwrap();

        match bind(&PackageRef::new(&url), false, None) {
            Err(Error::PackageInUse(owner)) => assert_eq!(owner, url),
            other => panic!("expected PackageInUse, got {:?}", other),
        }
        h1.close().unwrap();
        let h2 = bind(&PackageRef::new(&url), false, None).unwrap();
        h2.close().unwrap();
    }

    #[test]
    fn test_two_packages_share_backend() {
        let dir = TempDir::new().unwrap();
        let h1 = create(&PackageRef::new(file_url(&dir, "")), false, None).unwrap();
        let h2 = create(&PackageRef::new(file_url(&dir, "other")), false, None).unwrap();
        assert!(std::ptr::eq(h1.backend(), h2.backend()));
        // closing one package keeps the connection for the other
        h1.close().unwrap();
        assert!(!h2.backend().is_closed());
        h2.backend().create_tag("other", "t1").unwrap();
        h2.close().unwrap();
    }

    #[test]
    fn test_force_unsupported() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "");
        assert!(matches!(
            create(&PackageRef::new(&url), true, None),
            Err(Error::ForceUnsupported)
        ));
        let h = create(&PackageRef::new(&url), false, None).unwrap();
        h.close().unwrap();
        assert!(matches!(
            bind(&PackageRef::new(&url), true, None),
            Err(Error::ForceUnsupported)
        ));
    }

    #[test]
    #[should_panic(expected = "does not claim")]
    fn test_bind_missing_store_is_contract_violation() {
        let dir = TempDir::new().unwrap();
        let _ = bind(&PackageRef::new(file_url(&dir, "")), false, None);
    }

    #[test]
    fn test_dropping_handle_unbinds() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "");
        {
            let _h = create(&PackageRef::new(&url), false, None).unwrap();
            // dropped without close()
        }
        let h = bind(&PackageRef::new(&url), false, None).unwrap();
        h.close().unwrap();
    }

    #[test]
    fn test_closed_backend_is_evicted() {
        let dir = TempDir::new().unwrap();
        let url = file_url(&dir, "");
        let h = create(&PackageRef::new(&url), false, None).unwrap();
        let backend = cached_backend(&StorageUrl::parse(&url).unwrap().path.cache_key());
        assert!(backend.is_some());
        h.close().unwrap();
        let key = StorageUrl::parse(&url).unwrap().path.cache_key();
        assert!(cached_backend(&key).is_none());
    }

    #[test]
    fn test_in_memory_lifecycle() {
        // a single test covers :memory: end to end; the location is
        // process-global, so spreading it over tests would interleave
        assert!(claims_for_create(IN_MEMORY_URL));
        assert!(!claims_for_bind(IN_MEMORY_URL));

        let h1 = create(&PackageRef::new(IN_MEMORY_URL), false, None).unwrap();
        assert!(claims_for_bind(IN_MEMORY_URL));

        match bind(&PackageRef::new(IN_MEMORY_URL), false, None) {
            Err(Error::PackageInUse(owner)) => assert_eq!(owner, IN_MEMORY_URL),
            other => panic!("expected PackageInUse, got {:?}", other),
        }
        // creating is rejected the same way while the package is bound
        match create(&PackageRef::new(IN_MEMORY_URL), false, None) {
            Err(Error::PackageInUse(owner)) => assert_eq!(owner, IN_MEMORY_URL),
            other => panic!("expected PackageInUse, got {:?}", other),
        }

        let url2 = format!("{};extra", IN_MEMORY_URL);
        let h2 = create(&PackageRef::new(&url2), false, None).unwrap();
        h2.backend().create_tag("extra", "t1").unwrap();

        h1.close().unwrap();
        // the second package keeps the in-memory store alive
        assert!(claims_for_bind(&url2));
        h2.close().unwrap();
        // last close released the store; the contents are gone
        assert!(!claims_for_bind(IN_MEMORY_URL));
        assert!(!claims_for_bind(&url2));
    }
}
