//! SQLite backend implementation
//!
//! One `SqliteBackend` exists per storage location and is shared by every
//! package bound to it. Instances are created by [`crate::registry::create`]
//! and [`crate::registry::bind`], never directly.
//!
//! Every mutating operation flushes the live result iterators, then runs
//! its statements inside its own transaction; any storage failure rolls
//! the transaction back before surfacing, so no half-applied multi-row
//! change is ever visible.
//!
//! Known limitation: the file is not locked against concurrent *external*
//! processes. Transactions serialize writers within this process; other
//! processes opening the same file get best-effort behavior only.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::iter::{FlushTarget, FlushableIter, RowMapper};
use crate::element::{
    AnnotationFilter, Content, Element, ElementData, ElementFilter, ElementType, ImportFilter,
    Match, MediaFilter, TimeRange, UriMatch,
};
use crate::idref::{IdRef, UriRef};
use crate::location::StoragePath;
use crate::{Error, Result};

/// Transaction mode for `BEGIN`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Deferred,
    Immediate,
    Exclusive,
}

impl TxnMode {
    fn as_sql(&self) -> &'static str {
        match self {
            TxnMode::Deferred => "BEGIN",
            TxnMode::Immediate => "BEGIN IMMEDIATE",
            TxnMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Connection state shared by the backend and its live iterators.
pub(crate) struct Inner {
    /// `None` once the last bound package has been closed
    pub(crate) conn: Option<Connection>,
    /// package id -> URL of the in-process owner currently bound to it
    pub(crate) bound: HashMap<String, String>,
    /// live result iterators, flushed before every write
    pub(crate) iterators: Vec<Weak<dyn FlushTarget>>,
}

impl Inner {
    pub(crate) fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("backend used after close")
    }

    pub(crate) fn flush_iterators(&mut self) {
        let Some(conn) = self.conn.as_ref() else {
            return;
        };
        let iterators = std::mem::take(&mut self.iterators);
        let mut live = Vec::with_capacity(iterators.len());
        for weak in iterators {
            if let Some(target) = weak.upgrade() {
                target.flush(conn);
                live.push(weak);
            }
        }
        self.iterators = live;
    }

    /// Flush iterators, then open a transaction.
    /// Flushing must happen-before the transaction's first write.
    fn begin(&mut self, mode: TxnMode) -> Result<()> {
        self.flush_iterators();
        self.conn().execute_batch(mode.as_sql())?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Some(conn) = self.conn.as_ref() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!("rollback failed: {}", e);
            }
        }
    }

    /// Commit on success, roll back on error.
    fn finish(&mut self, res: Result<()>) -> Result<()> {
        match res {
            Ok(()) => self.commit(),
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn contains_package(&self, package_id: &str) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT id FROM Packages WHERE id = ?1",
                params![package_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn has_element(&self, package_id: &str, id: &str, kind: Option<ElementType>) -> Result<bool> {
        let typ: Option<String> = self
            .conn()
            .query_row(
                "SELECT typ FROM Elements WHERE package = ?1 AND id = ?2",
                params![package_id, id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match typ {
            None => false,
            Some(t) => kind.is_none_or(|k| t == k.as_str()),
        })
    }

    /// Contract check: a stored id-ref must point at an own element of the
    /// expected kind, or go through an existing import of the package.
    fn assert_resolvable(
        &self,
        package_id: &str,
        r: &IdRef,
        kind: Option<ElementType>,
    ) -> Result<()> {
        match r {
            IdRef::Own(id) => {
                let ok = self.has_element(package_id, id, kind)?;
                assert!(ok, "dangling reference {} in package {:?}", r, package_id);
            }
            IdRef::Imported { import, .. } => {
                let ok = self.has_element(package_id, import, Some(ElementType::Import))?;
                assert!(
                    ok,
                    "unknown import prefix {:?} in package {:?}",
                    import, package_id
                );
            }
        }
        Ok(())
    }

    /// Duplicate-id check plus `Elements` row insertion, atomically.
    /// Leaves the transaction open for the caller's kind-specific rows.
    fn create_element(&mut self, package_id: &str, id: &str, kind: ElementType) -> Result<()> {
        self.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            if self.has_element(package_id, id, None)? {
                return Err(Error::IdInUse(id.to_string()));
            }
            self.conn().execute(
                "INSERT INTO Elements (package, id, typ) VALUES (?1, ?2, ?3)",
                params![package_id, id, kind.as_str()],
            )?;
            Ok(())
        })();
        if let Err(e) = res {
            self.rollback();
            return Err(e);
        }
        Ok(())
    }

    fn count_ordered(&self, table: &str, owner_col: &str, package_id: &str, id: &str) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            &format!(
                "SELECT count(ord) FROM {} WHERE package = ?1 AND {} = ?2",
                table, owner_col
            ),
            params![package_id, id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

/// SQLite-backed package store.
///
/// State machine per package: `Unbound -> Bound` (via registry
/// create/bind) `-> Closed` (via [`SqliteBackend::close`]); re-opening a
/// closed package requires a fresh create/bind call. Once the last bound
/// package is closed the physical connection is released and any further
/// operation on this backend is a contract violation.
pub struct SqliteBackend {
    path: StoragePath,
    pub(crate) inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    pub(crate) fn new(path: StoragePath, conn: Connection) -> Self {
        Self {
            path,
            inner: Arc::new(Mutex::new(Inner {
                conn: Some(conn),
                bound: HashMap::new(),
                iterators: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A contract-violation panic (e.g. a failed `assert!`) may unwind while
        // this mutex is held, poisoning it. The panic then unwinds through
        // `PackageHandle::drop`, which re-enters `lock()` to close the package;
        // re-panicking here would be a panic-during-unwind and abort the
        // process. Recover the guard instead so cleanup can proceed.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Has the physical connection been released?
    pub fn is_closed(&self) -> bool {
        self.lock().conn.is_none()
    }

    pub(crate) fn contains_package(&self, package_id: &str) -> Result<bool> {
        self.lock().contains_package(package_id)
    }

    /// Bind a package to an owner URL, inside one EXCLUSIVE transaction
    /// with the existence check (and, for create, the row insertion).
    ///
    /// `create_row` distinguishes create from bind; `fresh` marks a store
    /// this process just initialized, whose default package row is not yet
    /// anyone's.
    pub(crate) fn bind_package(
        &self,
        package_id: &str,
        owner_url: &str,
        create_row: bool,
        fresh: bool,
    ) -> Result<()> {
        let mut g = self.lock();
        if let Some(owner) = g.bound.get(package_id) {
            return Err(Error::PackageInUse(owner.clone()));
        }
        g.begin(TxnMode::Exclusive)?;
        let res = (|| -> Result<()> {
            let exists = g.contains_package(package_id)?;
            if create_row {
                if exists && !fresh {
                    return Err(Error::PackageInUse(package_id.to_string()));
                }
                if !exists {
                    g.conn().execute(
                        "INSERT INTO Packages (id, uri, url) VALUES (?1, '', '')",
                        params![package_id],
                    )?;
                }
            } else if !exists {
                return Err(Error::NoSuchPackage(package_id.to_string()));
            }
            g.conn().execute(
                "UPDATE Packages SET url = ?1 WHERE id = ?2",
                params![owner_url, package_id],
            )?;
            Ok(())
        })();
        match res {
            Ok(()) => {
                g.commit()?;
                g.bound
                    .insert(package_id.to_string(), owner_url.to_string());
                Ok(())
            }
            Err(e) => {
                g.rollback();
                Err(e)
            }
        }
    }

    /// Inform the backend that a package will no longer be used.
    ///
    /// Clears its bound URL; when no package remains bound, releases the
    /// physical connection and evicts this backend from the process-wide
    /// cache. Closing an already-closed package is a no-op.
    pub fn close(&self, package_id: &str) -> Result<()> {
        let released = {
            let mut g = self.lock();
            if g.conn.is_none() {
                return Ok(());
            }
            g.flush_iterators();
            if g.bound.remove(package_id).is_some() {
                g.conn().execute(
                    "UPDATE Packages SET url = '' WHERE id = ?1",
                    params![package_id],
                )?;
            }
            if g.bound.is_empty() {
                tracing::debug!("releasing storage connection for {:?}", self.path);
                if let Some(conn) = g.conn.take() {
                    let _ = conn.execute("UPDATE Packages SET url = ''", []);
                    if let Err((_, e)) = conn.close() {
                        tracing::warn!("error closing connection: {}", e);
                    }
                }
                true
            } else {
                false
            }
        };
        if released {
            crate::registry::evict(&self.path);
        }
        Ok(())
    }

    /// Delete a stored package and every row belonging to it.
    ///
    /// Rejected while the package is bound.
    pub fn delete(&self, package_id: &str) -> Result<()> {
        let mut g = self.lock();
        if let Some(owner) = g.bound.get(package_id) {
            return Err(Error::PackageInUse(owner.clone()));
        }
        g.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            if !g.contains_package(package_id)? {
                return Err(Error::NoSuchPackage(package_id.to_string()));
            }
            let conn = g.conn();
            for table in [
                "Elements",
                "Medias",
                "Annotations",
                "Imports",
                "Contents",
                "Meta",
                "RelationMembers",
                "ListItems",
                "Tagged",
            ] {
                conn.execute(
                    &format!("DELETE FROM {} WHERE package = ?1", table),
                    params![package_id],
                )?;
            }
            conn.execute("DELETE FROM Packages WHERE id = ?1", params![package_id])?;
            Ok(())
        })();
        g.finish(res)
    }

    // ========== Package URI ==========

    /// Canonical URI advertised by a package ("" if none)
    pub fn get_uri(&self, package_id: &str) -> Result<String> {
        let g = self.lock();
        g.conn()
            .query_row(
                "SELECT uri FROM Packages WHERE id = ?1",
                params![package_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NoSuchPackage(package_id.to_string()))
    }

    pub fn update_uri(&self, package_id: &str, uri: &str) -> Result<()> {
        let mut g = self.lock();
        g.flush_iterators();
        let n = g.conn().execute(
            "UPDATE Packages SET uri = ?1 WHERE id = ?2",
            params![uri, package_id],
        )?;
        if n == 0 {
            return Err(Error::NoSuchPackage(package_id.to_string()));
        }
        Ok(())
    }

    // ========== Element Creation ==========

    pub fn create_media(&self, package_id: &str, id: &str, url: &str) -> Result<()> {
        let mut g = self.lock();
        g.create_element(package_id, id, ElementType::Media)?;
        let res = g
            .conn()
            .execute(
                "INSERT INTO Medias (package, id, url) VALUES (?1, ?2, ?3)",
                params![package_id, id, url],
            )
            .map(|_| ())
            .map_err(Error::from);
        g.finish(res)
    }

    /// Create an annotation on `media`, the id-ref of an own or directly
    /// imported media. Requires `begin <= end`.
    pub fn create_annotation(
        &self,
        package_id: &str,
        id: &str,
        media: &IdRef,
        begin: u64,
        end: u64,
    ) -> Result<()> {
        assert!(
            begin <= end,
            "annotation bounds out of order: {}..{}",
            begin,
            end
        );
        let mut g = self.lock();
        g.assert_resolvable(package_id, media, Some(ElementType::Media))?;
        g.create_element(package_id, id, ElementType::Annotation)?;
        let res = (|| -> Result<()> {
            g.conn().execute(
                "INSERT INTO Annotations (package, id, media_p, media_i, fbegin, fend) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    package_id,
                    id,
                    media.prefix(),
                    media.local_id(),
                    begin as i64,
                    end as i64
                ],
            )?;
            g.conn().execute(
                "INSERT INTO Contents (package, element, mimetype, data, schema_p, schema_i) \
                 VALUES (?1, ?2, 'text/plain', '', '', '')",
                params![package_id, id],
            )?;
            Ok(())
        })();
        g.finish(res)
    }

    pub fn create_relation(&self, package_id: &str, id: &str) -> Result<()> {
        self.create_simple(package_id, id, ElementType::Relation)
    }

    pub fn create_view(&self, package_id: &str, id: &str) -> Result<()> {
        self.create_simple(package_id, id, ElementType::View)
    }

    pub fn create_resource(&self, package_id: &str, id: &str) -> Result<()> {
        self.create_simple(package_id, id, ElementType::Resource)
    }

    pub fn create_tag(&self, package_id: &str, id: &str) -> Result<()> {
        self.create_simple(package_id, id, ElementType::Tag)
    }

    pub fn create_list(&self, package_id: &str, id: &str) -> Result<()> {
        self.create_simple(package_id, id, ElementType::List)
    }

    pub fn create_query(&self, package_id: &str, id: &str) -> Result<()> {
        self.create_simple(package_id, id, ElementType::Query)
    }

    pub fn create_import(&self, package_id: &str, id: &str, url: &str, uri: &str) -> Result<()> {
        let mut g = self.lock();
        g.create_element(package_id, id, ElementType::Import)?;
        let res = g
            .conn()
            .execute(
                "INSERT INTO Imports (package, id, url, uri) VALUES (?1, ?2, ?3, ?4)",
                params![package_id, id, url, uri],
            )
            .map(|_| ())
            .map_err(Error::from);
        g.finish(res)
    }

    fn create_simple(&self, package_id: &str, id: &str, kind: ElementType) -> Result<()> {
        let mut g = self.lock();
        g.create_element(package_id, id, kind)?;
        let res = if kind.has_content() {
            // relations carry no default mimetype, the other kinds do
            let mimetype = if kind == ElementType::Relation {
                ""
            } else {
                "text/plain"
            };
            g.conn()
                .execute(
                    "INSERT INTO Contents (package, element, mimetype, data, schema_p, schema_i) \
                     VALUES (?1, ?2, ?3, '', '', '')",
                    params![package_id, id, mimetype],
                )
                .map(|_| ())
                .map_err(Error::from)
        } else {
            Ok(())
        };
        g.finish(res)
    }

    // ========== Element Retrieval ==========

    /// Return true if the given package has an element with the given id.
    /// If `kind` is provided, only return true for an element of that kind.
    pub fn has_element(
        &self,
        package_id: &str,
        id: &str,
        kind: Option<ElementType>,
    ) -> Result<bool> {
        self.lock().has_element(package_id, id, kind)
    }

    /// Return the element with its kind-specific payload, `None` if absent.
    pub fn get_element(&self, package_id: &str, id: &str) -> Result<Option<Element>> {
        let g = self.lock();
        let conn = g.conn();
        let typ: Option<String> = conn
            .query_row(
                "SELECT typ FROM Elements WHERE package = ?1 AND id = ?2",
                params![package_id, id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(typ) = typ else {
            return Ok(None);
        };
        let data = match typ.parse::<ElementType>()? {
            ElementType::Media => conn.query_row(
                "SELECT url FROM Medias WHERE package = ?1 AND id = ?2",
                params![package_id, id],
                |row| {
                    Ok(ElementData::Media {
                        url: row.get(0)?,
                    })
                },
            )?,
            ElementType::Annotation => conn.query_row(
                "SELECT media_p, media_i, fbegin, fend FROM Annotations \
                 WHERE package = ?1 AND id = ?2",
                params![package_id, id],
                |row| {
                    Ok(ElementData::Annotation {
                        media: IdRef::from_columns(row.get(0)?, row.get(1)?),
                        begin: row.get::<_, i64>(2)? as u64,
                        end: row.get::<_, i64>(3)? as u64,
                    })
                },
            )?,
            ElementType::Import => conn.query_row(
                "SELECT url, uri FROM Imports WHERE package = ?1 AND id = ?2",
                params![package_id, id],
                |row| {
                    Ok(ElementData::Import {
                        url: row.get(0)?,
                        uri: row.get(1)?,
                    })
                },
            )?,
            ElementType::Relation => ElementData::Relation,
            ElementType::View => ElementData::View,
            ElementType::Resource => ElementData::Resource,
            ElementType::Tag => ElementData::Tag,
            ElementType::List => ElementData::List,
            ElementType::Query => ElementData::Query,
        };
        Ok(Some(Element {
            package_id: package_id.to_string(),
            id: id.to_string(),
            data,
        }))
    }

    // ========== Element Updates ==========

    pub fn update_media(&self, package_id: &str, id: &str, url: &str) -> Result<()> {
        let mut g = self.lock();
        let ok = g.has_element(package_id, id, Some(ElementType::Media))?;
        assert!(ok, "no media {:?} in package {:?}", id, package_id);
        g.flush_iterators();
        g.conn().execute(
            "UPDATE Medias SET url = ?1 WHERE package = ?2 AND id = ?3",
            params![url, package_id, id],
        )?;
        Ok(())
    }

    pub fn update_annotation(
        &self,
        package_id: &str,
        id: &str,
        media: &IdRef,
        begin: u64,
        end: u64,
    ) -> Result<()> {
        assert!(
            begin <= end,
            "annotation bounds out of order: {}..{}",
            begin,
            end
        );
        let mut g = self.lock();
        let ok = g.has_element(package_id, id, Some(ElementType::Annotation))?;
        assert!(ok, "no annotation {:?} in package {:?}", id, package_id);
        g.assert_resolvable(package_id, media, Some(ElementType::Media))?;
        g.flush_iterators();
        g.conn().execute(
            "UPDATE Annotations SET media_p = ?1, media_i = ?2, fbegin = ?3, fend = ?4 \
             WHERE package = ?5 AND id = ?6",
            params![
                media.prefix(),
                media.local_id(),
                begin as i64,
                end as i64,
                package_id,
                id
            ],
        )?;
        Ok(())
    }

    pub fn update_import(&self, package_id: &str, id: &str, url: &str, uri: &str) -> Result<()> {
        let mut g = self.lock();
        let ok = g.has_element(package_id, id, Some(ElementType::Import))?;
        assert!(ok, "no import {:?} in package {:?}", id, package_id);
        g.flush_iterators();
        g.conn().execute(
            "UPDATE Imports SET url = ?1, uri = ?2 WHERE package = ?3 AND id = ?4",
            params![url, uri, package_id, id],
        )?;
        Ok(())
    }

    // ========== Rename / Delete ==========

    /// Give an element a new id, rewriting every structural table that
    /// stores the id directly (its own rows, content and meta
    /// back-references, owned member/item rows, and - for imports - the
    /// prefix of every id-ref going through it).
    ///
    /// Id-refs held by *other* elements pointing at the renamed element
    /// are not touched; that is [`SqliteBackend::rename_references`]'s job.
    pub fn rename_element(
        &self,
        package_id: &str,
        old_id: &str,
        kind: ElementType,
        new_id: &str,
    ) -> Result<()> {
        let mut g = self.lock();
        let ok = g.has_element(package_id, old_id, Some(kind))?;
        assert!(ok, "no {} {:?} in package {:?}", kind, old_id, package_id);
        g.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            if g.has_element(package_id, new_id, None)? {
                return Err(Error::IdInUse(new_id.to_string()));
            }
            let conn = g.conn();
            conn.execute(
                "UPDATE Elements SET id = ?1 WHERE package = ?2 AND id = ?3",
                params![new_id, package_id, old_id],
            )?;
            conn.execute(
                "UPDATE Meta SET element = ?1 WHERE package = ?2 AND element = ?3",
                params![new_id, package_id, old_id],
            )?;
            let rename_in = |table: &str, col: &str| -> rusqlite::Result<usize> {
                conn.execute(
                    &format!(
                        "UPDATE {} SET {} = ?1 WHERE package = ?2 AND {} = ?3",
                        table, col, col
                    ),
                    params![new_id, package_id, old_id],
                )
            };
            match kind {
                ElementType::Media => {
                    rename_in("Medias", "id")?;
                }
                ElementType::Annotation => {
                    rename_in("Annotations", "id")?;
                    rename_in("Contents", "element")?;
                }
                ElementType::Relation => {
                    rename_in("Contents", "element")?;
                    rename_in("RelationMembers", "relation")?;
                }
                ElementType::View | ElementType::Resource | ElementType::Query => {
                    rename_in("Contents", "element")?;
                }
                ElementType::List => {
                    rename_in("ListItems", "list")?;
                }
                ElementType::Tag => {}
                ElementType::Import => {
                    rename_in("Imports", "id")?;
                    // id-refs going through the import keep resolving
                    rename_in("Annotations", "media_p")?;
                    rename_in("Contents", "schema_p")?;
                    rename_in("RelationMembers", "member_p")?;
                    rename_in("ListItems", "item_p")?;
                    rename_in("Tagged", "element_p")?;
                    rename_in("Tagged", "tag_p")?;
                }
            }
            Ok(())
        })();
        g.finish(res)
    }

    /// Remove an element and its own rows (kind row, content, meta, owned
    /// members/items). References held by other elements are the caller's
    /// responsibility; the store does not cascade.
    pub fn delete_element(&self, package_id: &str, id: &str, kind: ElementType) -> Result<()> {
        let mut g = self.lock();
        let ok = g.has_element(package_id, id, Some(kind))?;
        assert!(ok, "no {} {:?} in package {:?}", kind, id, package_id);
        g.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            let conn = g.conn();
            let delete_in = |table: &str, col: &str| -> rusqlite::Result<usize> {
                conn.execute(
                    &format!("DELETE FROM {} WHERE package = ?1 AND {} = ?2", table, col),
                    params![package_id, id],
                )
            };
            delete_in("Elements", "id")?;
            delete_in("Meta", "element")?;
            match kind {
                ElementType::Media => {
                    delete_in("Medias", "id")?;
                }
                ElementType::Annotation => {
                    delete_in("Annotations", "id")?;
                    delete_in("Contents", "element")?;
                }
                ElementType::Relation => {
                    delete_in("Contents", "element")?;
                    delete_in("RelationMembers", "relation")?;
                }
                ElementType::View | ElementType::Resource | ElementType::Query => {
                    delete_in("Contents", "element")?;
                }
                ElementType::List => {
                    delete_in("ListItems", "list")?;
                }
                ElementType::Tag => {}
                ElementType::Import => {
                    delete_in("Imports", "id")?;
                }
            }
            Ok(())
        })();
        g.finish(res)
    }

    /// Rewrite every stored id-ref in the given packages whose resolved
    /// absolute uri equals `old`, replacing its local part with `new_id`.
    ///
    /// Run after `rename_element`, in a second transaction: the caller
    /// renames the element, observes its old absolute uri, and only then
    /// knows which dependents to fix.
    pub fn rename_references(
        &self,
        package_ids: &[&str],
        old: &UriRef,
        new_id: &str,
    ) -> Result<()> {
        let mut g = self.lock();
        g.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            let conn = g.conn();
            for package_id in package_ids {
                // prefixes under which old resolves from this package:
                // "" when the package itself is the target, plus every
                // import whose uri or url matches
                let mut prefixes: Vec<String> = Vec::new();
                let own: Option<(String, String)> = conn
                    .query_row(
                        "SELECT uri, url FROM Packages WHERE id = ?1",
                        params![package_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                if let Some((uri, url)) = own {
                    if (!uri.is_empty() && uri == old.uri) || (!url.is_empty() && url == old.uri) {
                        prefixes.push(String::new());
                    }
                }
                let mut stmt = conn.prepare(
                    "SELECT id FROM Imports WHERE package = ?1 AND (uri = ?2 OR url = ?2)",
                )?;
                for id in stmt.query_map(params![package_id, old.uri], |row| {
                    row.get::<_, String>(0)
                })? {
                    prefixes.push(id?);
                }
                for prefix in &prefixes {
                    for (table, p_col, i_col) in [
                        ("Annotations", "media_p", "media_i"),
                        ("Contents", "schema_p", "schema_i"),
                        ("RelationMembers", "member_p", "member_i"),
                        ("ListItems", "item_p", "item_i"),
                        ("Tagged", "element_p", "element_i"),
                        ("Tagged", "tag_p", "tag_i"),
                    ] {
                        conn.execute(
                            &format!(
                                "UPDATE {} SET {} = ?1 WHERE package = ?2 AND {} = ?3 AND {} = ?4",
                                table, i_col, p_col, i_col
                            ),
                            params![new_id, package_id, prefix, old.fragment],
                        )?;
                    }
                }
            }
            Ok(())
        })();
        g.finish(res)
    }

    // ========== Element Iteration ==========

    /// Iterate the medias of the given packages.
    pub fn iter_medias(&self, package_ids: &[&str], filter: MediaFilter<'_>) -> FlushableIter<Element> {
        let mut sql = String::from("SELECT package, id, url FROM Medias WHERE ");
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "package", package_ids);
        push_match(&mut sql, &mut args, "id", filter.id);
        push_match(&mut sql, &mut args, "url", filter.url);
        self.make_iter(sql, args, media_row)
    }

    /// Iterate the annotations of the given packages, ordered by
    /// (begin, end, media id-ref). The media filter takes absolute
    /// uri-refs so that a media addressed as `import:x` by one caller and
    /// directly by another both match the same stored element.
    pub fn iter_annotations(
        &self,
        package_ids: &[&str],
        filter: AnnotationFilter<'_>,
    ) -> FlushableIter<Element> {
        let media_refs: &[UriRef] = match filter.media {
            UriMatch::Any => &[],
            UriMatch::Exact(m) => std::slice::from_ref(m),
            UriMatch::OneOf(ms) => ms,
        };
        let joined = !matches!(filter.media, UriMatch::Any);

        let mut sql = String::from(
            "SELECT a.package, a.id, a.media_p, a.media_i, a.fbegin, a.fend FROM Annotations a",
        );
        if joined {
            sql.push_str(
                " JOIN Packages p ON a.package = p.id \
                 LEFT JOIN Imports i ON a.package = i.package AND a.media_p = i.id",
            );
        }
        sql.push_str(" WHERE ");
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "a.package", package_ids);
        push_match(&mut sql, &mut args, "a.id", filter.id);
        if joined {
            sql.push_str(" AND (");
            for m in media_refs {
                sql.push_str(
                    "(a.media_i = ? AND (\
                       (a.media_p = '' AND ? IN (p.uri, p.url)) OR \
                       (a.media_p = i.id AND ? IN (i.uri, i.url)))) OR ",
                );
                args.push(Value::from(m.fragment.clone()));
                args.push(Value::from(m.uri.clone()));
                args.push(Value::from(m.uri.clone()));
            }
            sql.push_str("0)");
        }
        push_time(&mut sql, &mut args, "a.fbegin", filter.begin);
        push_time(&mut sql, &mut args, "a.fend", filter.end);
        sql.push_str(" ORDER BY a.fbegin, a.fend, a.media_p, a.media_i");
        self.make_iter(sql, args, annotation_row)
    }

    pub fn iter_relations(
        &self,
        package_ids: &[&str],
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        self.iter_simple(package_ids, ElementType::Relation, filter)
    }

    pub fn iter_views(
        &self,
        package_ids: &[&str],
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        self.iter_simple(package_ids, ElementType::View, filter)
    }

    pub fn iter_resources(
        &self,
        package_ids: &[&str],
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        self.iter_simple(package_ids, ElementType::Resource, filter)
    }

    pub fn iter_tags(
        &self,
        package_ids: &[&str],
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        self.iter_simple(package_ids, ElementType::Tag, filter)
    }

    pub fn iter_lists(
        &self,
        package_ids: &[&str],
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        self.iter_simple(package_ids, ElementType::List, filter)
    }

    pub fn iter_queries(
        &self,
        package_ids: &[&str],
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        self.iter_simple(package_ids, ElementType::Query, filter)
    }

    pub fn iter_imports(
        &self,
        package_ids: &[&str],
        filter: ImportFilter<'_>,
    ) -> FlushableIter<Element> {
        let mut sql = String::from("SELECT package, id, url, uri FROM Imports WHERE ");
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "package", package_ids);
        push_match(&mut sql, &mut args, "id", filter.id);
        push_match(&mut sql, &mut args, "url", filter.url);
        push_match(&mut sql, &mut args, "uri", filter.uri);
        self.make_iter(sql, args, import_row)
    }

    fn iter_simple(
        &self,
        package_ids: &[&str],
        kind: ElementType,
        filter: ElementFilter<'_>,
    ) -> FlushableIter<Element> {
        let mut sql = String::from("SELECT typ, package, id FROM Elements WHERE ");
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "package", package_ids);
        sql.push_str(" AND typ = ?");
        args.push(Value::from(kind.as_str().to_string()));
        push_match(&mut sql, &mut args, "id", filter.id);
        self.make_iter(sql, args, simple_row)
    }

    // ========== Content ==========

    /// Content of an annotation, relation, view, resource or query.
    /// `None` for elements that carry no content.
    pub fn get_content(&self, package_id: &str, id: &str) -> Result<Option<Content>> {
        let g = self.lock();
        let row: Option<(String, String, String, String)> = g
            .conn()
            .query_row(
                "SELECT mimetype, data, schema_p, schema_i FROM Contents \
                 WHERE package = ?1 AND element = ?2",
                params![package_id, id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        Ok(row.map(|(mimetype, data, schema_p, schema_i)| Content {
            mimetype,
            data,
            schema: if schema_i.is_empty() {
                None
            } else {
                Some(IdRef::from_columns(schema_p, schema_i))
            },
        }))
    }

    /// Update an element's content. `schema` is the id-ref of an own or
    /// directly imported resource, or `None` for no schema.
    pub fn update_content(
        &self,
        package_id: &str,
        id: &str,
        mimetype: &str,
        data: &str,
        schema: Option<&IdRef>,
    ) -> Result<()> {
        let mut g = self.lock();
        if let Some(schema) = schema {
            g.assert_resolvable(package_id, schema, Some(ElementType::Resource))?;
        }
        g.flush_iterators();
        let (schema_p, schema_i) = match schema {
            Some(s) => (s.prefix(), s.local_id()),
            None => ("", ""),
        };
        let n = g.conn().execute(
            "UPDATE Contents SET mimetype = ?1, data = ?2, schema_p = ?3, schema_i = ?4 \
             WHERE package = ?5 AND element = ?6",
            params![mimetype, data, schema_p, schema_i, package_id, id],
        )?;
        assert!(n == 1, "element {:?} in package {:?} has no content", id, package_id);
        Ok(())
    }

    // ========== Metadata ==========

    /// Iterate an element's metadata, keys in alphabetical order.
    /// `id = ""` addresses the package itself.
    pub fn iter_meta(&self, package_id: &str, id: &str) -> FlushableIter<(String, String)> {
        let sql = "SELECT key, value FROM Meta WHERE package = ?1 AND element = ?2 ORDER BY key"
            .to_string();
        let args = vec![
            Value::from(package_id.to_string()),
            Value::from(id.to_string()),
        ];
        self.make_iter(sql, args, meta_row)
    }

    pub fn get_meta(&self, package_id: &str, id: &str, key: &str) -> Result<Option<String>> {
        let g = self.lock();
        Ok(g.conn()
            .query_row(
                "SELECT value FROM Meta WHERE package = ?1 AND element = ?2 AND key = ?3",
                params![package_id, id, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Set or (with `None`) remove a metadata value.
    pub fn set_meta(
        &self,
        package_id: &str,
        id: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut g = self.lock();
        g.flush_iterators();
        match value {
            Some(value) => {
                g.conn().execute(
                    "INSERT OR REPLACE INTO Meta (package, element, key, value) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![package_id, id, key, value],
                )?;
            }
            None => {
                g.conn().execute(
                    "DELETE FROM Meta WHERE package = ?1 AND element = ?2 AND key = ?3",
                    params![package_id, id, key],
                )?;
            }
        }
        Ok(())
    }

    // ========== Relation Members ==========

    /// Insert a member at `pos`, shifting subsequent members up.
    /// `pos` ranges over -1..=n where n is the current count; -1 appends.
    /// `member` is the id-ref of an own or directly imported annotation.
    pub fn insert_member(
        &self,
        package_id: &str,
        relation: &str,
        member: &IdRef,
        pos: i64,
    ) -> Result<()> {
        self.insert_ordered(
            "RelationMembers",
            "relation",
            "member_p",
            "member_i",
            Some(ElementType::Annotation),
            package_id,
            relation,
            member,
            pos,
        )
    }

    /// Replace the member at `pos` without changing the count.
    pub fn update_member(
        &self,
        package_id: &str,
        relation: &str,
        member: &IdRef,
        pos: usize,
    ) -> Result<()> {
        self.update_ordered(
            "RelationMembers",
            "relation",
            "member_p",
            "member_i",
            Some(ElementType::Annotation),
            package_id,
            relation,
            member,
            pos,
        )
    }

    /// Remove the member at `pos`, shifting subsequent members down.
    pub fn remove_member(&self, package_id: &str, relation: &str, pos: usize) -> Result<()> {
        self.remove_ordered("RelationMembers", "relation", package_id, relation, pos)
    }

    /// Number of members; 0 for a relation with none (or no such relation).
    pub fn count_members(&self, package_id: &str, relation: &str) -> Result<usize> {
        self.lock()
            .count_ordered("RelationMembers", "relation", package_id, relation)
    }

    /// Member at `pos`; negative positions count from the end.
    pub fn get_member(&self, package_id: &str, relation: &str, pos: i64) -> Result<IdRef> {
        self.get_ordered(
            "RelationMembers",
            "relation",
            "member_p",
            "member_i",
            package_id,
            relation,
            pos,
        )
    }

    /// Iterate a relation's members in order.
    pub fn iter_members(&self, package_id: &str, relation: &str) -> FlushableIter<IdRef> {
        let sql = "SELECT member_p, member_i FROM RelationMembers \
                   WHERE package = ?1 AND relation = ?2 ORDER BY ord"
            .to_string();
        let args = vec![
            Value::from(package_id.to_string()),
            Value::from(relation.to_string()),
        ];
        self.make_iter(sql, args, idref_row)
    }

    /// Relations of the given packages having `member`, optionally at a
    /// given position. `member` is an absolute uri-ref.
    pub fn iter_relations_with_member(
        &self,
        package_ids: &[&str],
        member: &UriRef,
        pos: Option<u64>,
    ) -> FlushableIter<Element> {
        self.iter_owners_with_ref(
            "RelationMembers",
            "relation",
            "member_p",
            "member_i",
            package_ids,
            member,
            pos,
        )
    }

    // ========== List Items ==========

    /// Insert an item at `pos`; same position contract as
    /// [`SqliteBackend::insert_member`]. `item` may reference an element
    /// of any kind.
    pub fn insert_item(&self, package_id: &str, list: &str, item: &IdRef, pos: i64) -> Result<()> {
        self.insert_ordered(
            "ListItems", "list", "item_p", "item_i", None, package_id, list, item, pos,
        )
    }

    pub fn update_item(&self, package_id: &str, list: &str, item: &IdRef, pos: usize) -> Result<()> {
        self.update_ordered(
            "ListItems", "list", "item_p", "item_i", None, package_id, list, item, pos,
        )
    }

    pub fn remove_item(&self, package_id: &str, list: &str, pos: usize) -> Result<()> {
        self.remove_ordered("ListItems", "list", package_id, list, pos)
    }

    pub fn count_items(&self, package_id: &str, list: &str) -> Result<usize> {
        self.lock().count_ordered("ListItems", "list", package_id, list)
    }

    pub fn get_item(&self, package_id: &str, list: &str, pos: i64) -> Result<IdRef> {
        self.get_ordered("ListItems", "list", "item_p", "item_i", package_id, list, pos)
    }

    /// Iterate a list's items in order.
    pub fn iter_items(&self, package_id: &str, list: &str) -> FlushableIter<IdRef> {
        let sql = "SELECT item_p, item_i FROM ListItems \
                   WHERE package = ?1 AND list = ?2 ORDER BY ord"
            .to_string();
        let args = vec![
            Value::from(package_id.to_string()),
            Value::from(list.to_string()),
        ];
        self.make_iter(sql, args, idref_row)
    }

    /// Lists of the given packages having `item`, optionally at a given
    /// position. `item` is an absolute uri-ref.
    pub fn iter_lists_with_item(
        &self,
        package_ids: &[&str],
        item: &UriRef,
        pos: Option<u64>,
    ) -> FlushableIter<Element> {
        self.iter_owners_with_ref(
            "ListItems", "list", "item_p", "item_i", package_ids, item, pos,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_ordered(
        &self,
        table: &str,
        owner_col: &str,
        p_col: &str,
        i_col: &str,
        kind: Option<ElementType>,
        package_id: &str,
        owner: &str,
        value: &IdRef,
        pos: i64,
    ) -> Result<()> {
        let mut g = self.lock();
        g.assert_resolvable(package_id, value, kind)?;
        let n = g.count_ordered(table, owner_col, package_id, owner)? as i64;
        assert!(
            (-1..=n).contains(&pos),
            "position out of range: {} (count {})",
            pos,
            n
        );
        let pos = if pos == -1 { n } else { pos };
        g.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            let conn = g.conn();
            // shift one row at a time, highest index first, so the dense
            // positional index never trips its uniqueness constraint
            for i in (pos..n).rev() {
                conn.execute(
                    &format!(
                        "UPDATE {} SET ord = ord + 1 WHERE package = ?1 AND {} = ?2 AND ord = ?3",
                        table, owner_col
                    ),
                    params![package_id, owner, i],
                )?;
            }
            conn.execute(
                &format!(
                    "INSERT INTO {} (package, {}, ord, {}, {}) VALUES (?1, ?2, ?3, ?4, ?5)",
                    table, owner_col, p_col, i_col
                ),
                params![package_id, owner, pos, value.prefix(), value.local_id()],
            )?;
            Ok(())
        })();
        g.finish(res)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_ordered(
        &self,
        table: &str,
        owner_col: &str,
        p_col: &str,
        i_col: &str,
        kind: Option<ElementType>,
        package_id: &str,
        owner: &str,
        value: &IdRef,
        pos: usize,
    ) -> Result<()> {
        let mut g = self.lock();
        g.assert_resolvable(package_id, value, kind)?;
        let n = g.count_ordered(table, owner_col, package_id, owner)?;
        assert!(pos < n, "position out of range: {} (count {})", pos, n);
        g.flush_iterators();
        g.conn().execute(
            &format!(
                "UPDATE {} SET {} = ?1, {} = ?2 WHERE package = ?3 AND {} = ?4 AND ord = ?5",
                table, p_col, i_col, owner_col
            ),
            params![
                value.prefix(),
                value.local_id(),
                package_id,
                owner,
                pos as i64
            ],
        )?;
        Ok(())
    }

    fn remove_ordered(
        &self,
        table: &str,
        owner_col: &str,
        package_id: &str,
        owner: &str,
        pos: usize,
    ) -> Result<()> {
        let mut g = self.lock();
        let n = g.count_ordered(table, owner_col, package_id, owner)?;
        assert!(pos < n, "position out of range: {} (count {})", pos, n);
        g.begin(TxnMode::Immediate)?;
        let res = (|| -> Result<()> {
            let conn = g.conn();
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE package = ?1 AND {} = ?2 AND ord = ?3",
                    table, owner_col
                ),
                params![package_id, owner, pos as i64],
            )?;
            // shift down one row at a time, lowest index first
            for i in pos + 1..n {
                conn.execute(
                    &format!(
                        "UPDATE {} SET ord = ord - 1 WHERE package = ?1 AND {} = ?2 AND ord = ?3",
                        table, owner_col
                    ),
                    params![package_id, owner, i as i64],
                )?;
            }
            Ok(())
        })();
        g.finish(res)
    }

    fn get_ordered(
        &self,
        table: &str,
        owner_col: &str,
        p_col: &str,
        i_col: &str,
        package_id: &str,
        owner: &str,
        pos: i64,
    ) -> Result<IdRef> {
        let g = self.lock();
        let n = g.count_ordered(table, owner_col, package_id, owner)? as i64;
        assert!(
            -n <= pos && pos < n,
            "position out of range: {} (count {})",
            pos,
            n
        );
        let pos = if pos < 0 { pos + n } else { pos };
        let (p, i) = g.conn().query_row(
            &format!(
                "SELECT {}, {} FROM {} WHERE package = ?1 AND {} = ?2 AND ord = ?3",
                p_col, i_col, table, owner_col
            ),
            params![package_id, owner, pos],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(IdRef::from_columns(p, i))
    }

    fn iter_owners_with_ref(
        &self,
        table: &str,
        owner_col: &str,
        p_col: &str,
        i_col: &str,
        package_ids: &[&str],
        target: &UriRef,
        pos: Option<u64>,
    ) -> FlushableIter<Element> {
        let mut sql = format!(
            "SELECT DISTINCT e.typ, e.package, e.id FROM Elements e \
             JOIN Packages p ON e.package = p.id \
             JOIN {table} m ON e.package = m.package AND e.id = m.{owner_col} \
             LEFT JOIN Imports i ON m.package = i.package AND m.{p_col} = i.id \
             WHERE "
        );
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "e.package", package_ids);
        sql.push_str(&format!(
            " AND m.{i_col} = ? AND (\
               (m.{p_col} = '' AND ? IN (p.uri, p.url)) OR \
               (m.{p_col} = i.id AND ? IN (i.uri, i.url)))"
        ));
        args.push(Value::from(target.fragment.clone()));
        args.push(Value::from(target.uri.clone()));
        args.push(Value::from(target.uri.clone()));
        if let Some(pos) = pos {
            sql.push_str(" AND m.ord = ?");
            args.push(Value::from(pos as i64));
        }
        self.make_iter(sql, args, simple_row)
    }

    // ========== Tag Associations ==========

    /// Associate a tag to an element. Idempotent: associating an already
    /// associated pair is a no-op. Both are id-refs of own or directly
    /// imported elements.
    pub fn associate_tag(&self, package_id: &str, element: &IdRef, tag: &IdRef) -> Result<()> {
        let mut g = self.lock();
        g.assert_resolvable(package_id, element, None)?;
        g.assert_resolvable(package_id, tag, Some(ElementType::Tag))?;
        g.flush_iterators();
        g.conn().execute(
            "INSERT OR IGNORE INTO Tagged (package, element_p, element_i, tag_p, tag_i) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                package_id,
                element.prefix(),
                element.local_id(),
                tag.prefix(),
                tag.local_id()
            ],
        )?;
        Ok(())
    }

    /// Dissociate a tag from an element; a no-op on a non-associated pair.
    pub fn dissociate_tag(&self, package_id: &str, element: &IdRef, tag: &IdRef) -> Result<()> {
        let mut g = self.lock();
        g.flush_iterators();
        g.conn().execute(
            "DELETE FROM Tagged WHERE package = ?1 \
             AND element_p = ?2 AND element_i = ?3 AND tag_p = ?4 AND tag_i = ?5",
            params![
                package_id,
                element.prefix(),
                element.local_id(),
                tag.prefix(),
                tag.local_id()
            ],
        )?;
        Ok(())
    }

    /// All (package, tag id-ref) pairs associated to `element` in the
    /// given packages. `element` is an absolute uri-ref.
    pub fn iter_tags_with_element(
        &self,
        package_ids: &[&str],
        element: &UriRef,
    ) -> FlushableIter<(String, IdRef)> {
        self.iter_tagged_side(package_ids, element, "element_p", "element_i", "tag_p", "tag_i")
    }

    /// All (package, element id-ref) pairs associated to `tag` in the
    /// given packages. `tag` is an absolute uri-ref.
    pub fn iter_elements_with_tag(
        &self,
        package_ids: &[&str],
        tag: &UriRef,
    ) -> FlushableIter<(String, IdRef)> {
        self.iter_tagged_side(package_ids, tag, "tag_p", "tag_i", "element_p", "element_i")
    }

    fn iter_tagged_side(
        &self,
        package_ids: &[&str],
        target: &UriRef,
        match_p: &str,
        match_i: &str,
        yield_p: &str,
        yield_i: &str,
    ) -> FlushableIter<(String, IdRef)> {
        let mut sql = format!(
            "SELECT t.package, t.{yield_p}, t.{yield_i} FROM Tagged t \
             JOIN Packages p ON t.package = p.id \
             LEFT JOIN Imports i ON t.package = i.package AND t.{match_p} = i.id \
             WHERE "
        );
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "t.package", package_ids);
        sql.push_str(&format!(
            " AND t.{match_i} = ? AND (\
               (t.{match_p} = '' AND ? IN (p.uri, p.url)) OR \
               (t.{match_p} = i.id AND ? IN (i.uri, i.url)))"
        ));
        args.push(Value::from(target.fragment.clone()));
        args.push(Value::from(target.uri.clone()));
        args.push(Value::from(target.uri.clone()));
        self.make_iter(sql, args, tagging_row)
    }

    /// The packages (among `package_ids`) that associate exactly this
    /// element to exactly this tag; both are absolute uri-refs.
    pub fn iter_tagging(
        &self,
        package_ids: &[&str],
        element: &UriRef,
        tag: &UriRef,
    ) -> FlushableIter<String> {
        let mut sql = String::from(
            "SELECT DISTINCT t.package FROM Tagged t \
             JOIN Packages p ON t.package = p.id \
             LEFT JOIN Imports ie ON t.package = ie.package AND t.element_p = ie.id \
             LEFT JOIN Imports it ON t.package = it.package AND t.tag_p = it.id \
             WHERE ",
        );
        let mut args = Vec::new();
        push_package_clause(&mut sql, &mut args, "t.package", package_ids);
        sql.push_str(
            " AND t.element_i = ? AND (\
               (t.element_p = '' AND ? IN (p.uri, p.url)) OR \
               (t.element_p = ie.id AND ? IN (ie.uri, ie.url))) \
             AND t.tag_i = ? AND (\
               (t.tag_p = '' AND ? IN (p.uri, p.url)) OR \
               (t.tag_p = it.id AND ? IN (it.uri, it.url)))",
        );
        args.push(Value::from(element.fragment.clone()));
        args.push(Value::from(element.uri.clone()));
        args.push(Value::from(element.uri.clone()));
        args.push(Value::from(tag.fragment.clone()));
        args.push(Value::from(tag.uri.clone()));
        args.push(Value::from(tag.uri.clone()));
        self.make_iter(sql, args, package_row)
    }

    // ========== Diagnostics ==========

    /// Ids of every package stored at this location.
    pub fn packages(&self) -> Result<Vec<String>> {
        let g = self.lock();
        let mut stmt = g.conn().prepare("SELECT id FROM Packages ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Element counts across the whole storage location.
    pub fn stats(&self) -> Result<StoreStats> {
        let g = self.lock();
        let conn = g.conn();
        let packages: i64 = conn.query_row("SELECT count(*) FROM Packages", [], |row| row.get(0))?;
        let mut stats = StoreStats {
            packages: packages as usize,
            ..StoreStats::default()
        };
        let mut stmt = conn.prepare("SELECT typ, count(*) FROM Elements GROUP BY typ")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (typ, count) = row?;
            let count = count as usize;
            match typ.parse::<ElementType>()? {
                ElementType::Media => stats.medias = count,
                ElementType::Annotation => stats.annotations = count,
                ElementType::Relation => stats.relations = count,
                ElementType::View => stats.views = count,
                ElementType::Resource => stats.resources = count,
                ElementType::Tag => stats.tags = count,
                ElementType::List => stats.lists = count,
                ElementType::Query => stats.queries = count,
                ElementType::Import => stats.imports = count,
            }
        }
        Ok(stats)
    }

    fn make_iter<T: Send + 'static>(
        &self,
        sql: String,
        params: Vec<Value>,
        map: RowMapper<T>,
    ) -> FlushableIter<T> {
        let mut g = self.lock();
        FlushableIter::register(&self.inner, &mut g, sql, params, map)
    }
}

// ========== Query building helpers ==========

fn push_package_clause(sql: &mut String, args: &mut Vec<Value>, col: &str, package_ids: &[&str]) {
    if package_ids.is_empty() {
        sql.push('0');
        return;
    }
    sql.push_str(col);
    sql.push_str(" IN (");
    for (i, p) in package_ids.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
        args.push(Value::from(p.to_string()));
    }
    sql.push(')');
}

fn push_match(sql: &mut String, args: &mut Vec<Value>, col: &str, m: Match<'_>) {
    match m {
        Match::Any => {}
        Match::Exact(v) => {
            sql.push_str(" AND ");
            sql.push_str(col);
            sql.push_str(" = ?");
            args.push(Value::from(v.to_string()));
        }
        Match::OneOf(vs) => {
            if vs.is_empty() {
                sql.push_str(" AND 0");
                return;
            }
            sql.push_str(" AND ");
            sql.push_str(col);
            sql.push_str(" IN (");
            for (i, v) in vs.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                args.push(Value::from(v.to_string()));
            }
            sql.push(')');
        }
    }
}

fn push_time(sql: &mut String, args: &mut Vec<Value>, col: &str, t: TimeRange) {
    assert!(
        t.eq.is_none() || (t.min.is_none() && t.max.is_none()),
        "eq filter is exclusive with min/max"
    );
    if let Some(v) = t.eq {
        sql.push_str(&format!(" AND {} = ?", col));
        args.push(Value::from(v as i64));
    }
    if let Some(v) = t.min {
        sql.push_str(&format!(" AND {} >= ?", col));
        args.push(Value::from(v as i64));
    }
    if let Some(v) = t.max {
        sql.push_str(&format!(" AND {} <= ?", col));
        args.push(Value::from(v as i64));
    }
}

// ========== Row mappers ==========

fn media_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Element> {
    Ok(Element {
        package_id: row.get(0)?,
        id: row.get(1)?,
        data: ElementData::Media { url: row.get(2)? },
    })
}

fn annotation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Element> {
    Ok(Element {
        package_id: row.get(0)?,
        id: row.get(1)?,
        data: ElementData::Annotation {
            media: IdRef::from_columns(row.get(2)?, row.get(3)?),
            begin: row.get::<_, i64>(4)? as u64,
            end: row.get::<_, i64>(5)? as u64,
        },
    })
}

fn import_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Element> {
    Ok(Element {
        package_id: row.get(0)?,
        id: row.get(1)?,
        data: ElementData::Import {
            url: row.get(2)?,
            uri: row.get(3)?,
        },
    })
}

fn simple_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Element> {
    let typ: String = row.get(0)?;
    let kind: ElementType = typ.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let data = ElementData::simple(kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(Error::InvalidReference(format!(
                "not a simple element type: {}",
                kind
            ))),
        )
    })?;
    Ok(Element {
        package_id: row.get(1)?,
        id: row.get(2)?,
        data,
    })
}

fn idref_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdRef> {
    Ok(IdRef::from_columns(row.get(0)?, row.get(1)?))
}

fn meta_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn tagging_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, IdRef)> {
    Ok((
        row.get(0)?,
        IdRef::from_columns(row.get(1)?, row.get(2)?),
    ))
}

fn package_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

/// Per-kind element counts for a storage location
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub packages: usize,
    pub medias: usize,
    pub annotations: usize,
    pub relations: usize,
    pub views: usize,
    pub resources: usize,
    pub tags: usize,
    pub lists: usize,
    pub queries: usize,
    pub imports: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Storage statistics:")?;
        writeln!(f, "  Packages: {}", self.packages)?;
        writeln!(f, "  Medias: {}", self.medias)?;
        writeln!(f, "  Annotations: {}", self.annotations)?;
        writeln!(f, "  Relations: {}", self.relations)?;
        writeln!(f, "  Views: {}", self.views)?;
        writeln!(f, "  Resources: {}", self.resources)?;
        writeln!(f, "  Tags: {}", self.tags)?;
        writeln!(f, "  Lists: {}", self.lists)?;
        writeln!(f, "  Queries: {}", self.queries)?;
        write!(f, "  Imports: {}", self.imports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{create, PackageRef};
    use crate::PackageHandle;
    use tempfile::TempDir;

    const P2: &str = "p2";
    const P2_URI: &str = "urn:p2";

    fn store_url(dir: &TempDir, pkg: &str) -> String {
        let path = dir.path().join("store.db");
        if pkg.is_empty() {
            format!("sqlite:{}", path.display())
        } else {
            format!("sqlite:{};{}", path.display(), pkg)
        }
    }

    fn open_store() -> (TempDir, PackageHandle) {
        let dir = TempDir::new().unwrap();
        let url = store_url(&dir, "");
        let handle = create(&PackageRef::new(&url), false, None).unwrap();
        (dir, handle)
    }

    /// Two packages in one location: the default package imports P2 (which
    /// advertises uri "urn:p2") under the local name "i1", plus a decoy
    /// import "i2" pointing elsewhere.
    fn open_two() -> (TempDir, PackageHandle, PackageHandle) {
        let dir = TempDir::new().unwrap();
        let url1 = store_url(&dir, "");
        let url2 = store_url(&dir, P2);
        let h1 = create(&PackageRef::new(&url1), false, None).unwrap();
        let h2 = create(&PackageRef::new(&url2), false, None).unwrap();
        let be = h1.backend();
        be.update_uri(P2, P2_URI).unwrap();

        be.create_import("", "i1", &url2, P2_URI).unwrap();
        be.create_import("", "i2", "http://elsewhere/pkg", "urn:other")
            .unwrap();

        be.create_media(P2, "m3", "file:///tmp/m3.avi").unwrap();
        be.create_annotation(P2, "a5", &IdRef::own("m3"), 10, 20)
            .unwrap();
        be.create_annotation(P2, "a6", &IdRef::own("m3"), 30, 40)
            .unwrap();
        be.create_tag(P2, "t3").unwrap();
        be.create_relation(P2, "r3").unwrap();
        be.create_list(P2, "l3").unwrap();
        be.create_resource(P2, "R3").unwrap();

        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::imported("i1", "m3"), 1, 2)
            .unwrap();
        be.create_annotation("", "a2", &IdRef::imported("i2", "m3"), 1, 2)
            .unwrap();
        be.create_tag("", "t1").unwrap();
        be.create_relation("", "r1").unwrap();
        be.create_list("", "l1").unwrap();
        be.create_resource("", "R1").unwrap();

        (dir, h1, h2)
    }

    #[test]
    fn test_duplicate_id_is_model_error() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "x", "movie.mp4").unwrap();
        for result in [
            be.create_media("", "x", "other.mp4"),
            be.create_tag("", "x"),
            be.create_list("", "x"),
        ] {
            match result {
                Err(Error::IdInUse(id)) => assert_eq!(id, "x"),
                other => panic!("expected IdInUse, got {:?}", other),
            }
        }
        // element count unchanged, store still consistent
        let stats = be.stats().unwrap();
        assert_eq!(stats.medias, 1);
        assert_eq!(stats.tags, 0);
        assert_eq!(stats.lists, 0);
        be.create_tag("", "y").unwrap();
    }

    #[test]
    fn test_annotation_scenario() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 1000, 2000)
            .unwrap();

        let e = be.get_element("", "a1").unwrap().unwrap();
        assert_eq!(e.package_id, "");
        assert_eq!(e.id, "a1");
        assert_eq!(
            e.data,
            ElementData::Annotation {
                media: IdRef::own("m1"),
                begin: 1000,
                end: 2000,
            }
        );
        // a fresh annotation owns an empty text/plain content
        let content = be.get_content("", "a1").unwrap().unwrap();
        assert_eq!(content.mimetype, "text/plain");
        assert_eq!(content.data, "");
        assert_eq!(content.schema, None);

        assert!(be.get_element("", "nope").unwrap().is_none());
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_annotation_bounds_contract() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        let _ = be.create_annotation("", "a1", &IdRef::own("m1"), 2000, 1000);
    }

    #[test]
    #[should_panic(expected = "dangling reference")]
    fn test_annotation_dangling_media_contract() {
        let (_dir, h) = open_store();
        let _ = h
            .backend()
            .create_annotation("", "a1", &IdRef::own("missing"), 0, 1);
    }

    #[test]
    fn test_member_scenario() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 0, 1).unwrap();
        be.create_annotation("", "a2", &IdRef::own("m1"), 1, 2).unwrap();
        be.create_relation("", "r1").unwrap();

        be.insert_member("", "r1", &IdRef::own("a1"), -1).unwrap();
        be.insert_member("", "r1", &IdRef::own("a2"), 0).unwrap();
        let members: Vec<_> = be.iter_members("", "r1").collect();
        assert_eq!(members, vec![IdRef::own("a2"), IdRef::own("a1")]);

        assert_eq!(be.get_member("", "r1", -1).unwrap(), IdRef::own("a1"));
        assert_eq!(be.get_member("", "r1", 0).unwrap(), IdRef::own("a2"));

        be.remove_member("", "r1", 0).unwrap();
        let members: Vec<_> = be.iter_members("", "r1").collect();
        assert_eq!(members, vec![IdRef::own("a1")]);
        assert_eq!(be.count_members("", "r1").unwrap(), 1);
    }

    #[test]
    fn test_positions_stay_dense() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_list("", "l1").unwrap();
        let ids = ["e0", "e1", "e2", "e3", "e4"];
        for id in ids {
            be.create_annotation("", id, &IdRef::own("m1"), 0, 1).unwrap();
        }
        be.insert_item("", "l1", &IdRef::own("e0"), -1).unwrap();
        be.insert_item("", "l1", &IdRef::own("e1"), -1).unwrap();
        be.insert_item("", "l1", &IdRef::own("e2"), 1).unwrap();
        be.insert_item("", "l1", &IdRef::own("e3"), 0).unwrap();
        // e3 e0 e2 e1
        be.remove_item("", "l1", 2).unwrap();
        be.insert_item("", "l1", &IdRef::own("e4"), 1).unwrap();
        // e3 e4 e0 e1
        let items: Vec<_> = be.iter_items("", "l1").collect();
        assert_eq!(
            items,
            vec![
                IdRef::own("e3"),
                IdRef::own("e4"),
                IdRef::own("e0"),
                IdRef::own("e1"),
            ]
        );
        // positions form exactly 0..n-1
        let n = be.count_items("", "l1").unwrap();
        for (pos, item) in items.iter().enumerate() {
            assert_eq!(&be.get_item("", "l1", pos as i64).unwrap(), item);
        }
        assert_eq!(n, items.len());
    }

    #[test]
    #[should_panic(expected = "position out of range")]
    fn test_member_position_contract() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 0, 1).unwrap();
        be.create_relation("", "r1").unwrap();
        let _ = be.insert_member("", "r1", &IdRef::own("a1"), 1);
    }

    #[test]
    fn test_count_of_missing_owner_is_zero() {
        let (_dir, h) = open_store();
        assert_eq!(h.backend().count_members("", "nope").unwrap(), 0);
        assert_eq!(h.backend().count_items("", "nope").unwrap(), 0);
    }

    #[test]
    fn test_update_member() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 0, 1).unwrap();
        be.create_annotation("", "a2", &IdRef::own("m1"), 1, 2).unwrap();
        be.create_relation("", "r1").unwrap();
        be.insert_member("", "r1", &IdRef::own("a1"), -1).unwrap();
        be.update_member("", "r1", &IdRef::own("a2"), 0).unwrap();
        assert_eq!(be.get_member("", "r1", 0).unwrap(), IdRef::own("a2"));
        assert_eq!(be.count_members("", "r1").unwrap(), 1);
    }

    #[test]
    fn test_tag_idempotence() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_tag("", "t1").unwrap();
        be.associate_tag("", &IdRef::own("m1"), &IdRef::own("t1"))
            .unwrap();
        be.associate_tag("", &IdRef::own("m1"), &IdRef::own("t1"))
            .unwrap();
        let uri = format!("{}#m1", store_url(&_dir, ""));
        let tags: Vec<_> = be
            .iter_tags_with_element(&[""], &UriRef::parse(&uri).unwrap())
            .collect();
        assert_eq!(tags, vec![(String::new(), IdRef::own("t1"))]);

        // dissociating a non-associated pair is a no-op
        be.create_tag("", "t2").unwrap();
        be.dissociate_tag("", &IdRef::own("m1"), &IdRef::own("t2"))
            .unwrap();
        be.dissociate_tag("", &IdRef::own("m1"), &IdRef::own("t1"))
            .unwrap();
        let tags: Vec<_> = be
            .iter_tags_with_element(&[""], &UriRef::parse(&uri).unwrap())
            .collect();
        assert!(tags.is_empty());
    }

    #[test]
    fn test_tags_across_packages() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        // tag the imported annotation from the importing package, and the
        // same annotation directly from its own package
        be.associate_tag("", &IdRef::imported("i1", "a5"), &IdRef::own("t1"))
            .unwrap();
        be.associate_tag(P2, &IdRef::own("a5"), &IdRef::own("t3"))
            .unwrap();

        let a5 = UriRef::new(P2_URI, "a5");
        let pids = ["", P2];
        let mut tags: Vec<_> = be.iter_tags_with_element(&pids, &a5).collect();
        tags.sort();
        assert_eq!(
            tags,
            vec![
                (String::new(), IdRef::own("t1")),
                (P2.to_string(), IdRef::own("t3")),
            ]
        );

        let t3 = UriRef::new(P2_URI, "t3");
        let elements: Vec<_> = be.iter_elements_with_tag(&pids, &t3).collect();
        assert_eq!(elements, vec![(P2.to_string(), IdRef::own("a5"))]);

        let tagging: Vec<_> = be.iter_tagging(&pids, &a5, &t3).collect();
        assert_eq!(tagging, vec![P2.to_string()]);

        // restricting the packages restricts the answers
        let tags: Vec<_> = be.iter_tags_with_element(&[P2], &a5).collect();
        assert_eq!(tags, vec![(P2.to_string(), IdRef::own("t3"))]);
    }

    #[test]
    fn test_reverse_lookups_resolve_aliases() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        be.insert_member(P2, "r3", &IdRef::own("a5"), -1).unwrap();
        be.insert_member("", "r1", &IdRef::imported("i1", "a5"), -1)
            .unwrap();
        be.insert_member("", "r1", &IdRef::imported("i2", "a5"), -1)
            .unwrap(); // alias trap: i2 points elsewhere

        let a5 = UriRef::new(P2_URI, "a5");
        let pids = ["", P2];
        let mut found: Vec<_> = be
            .iter_relations_with_member(&pids, &a5, None)
            .map(|e| (e.package_id, e.id))
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                (String::new(), "r1".to_string()),
                (P2.to_string(), "r3".to_string()),
            ]
        );

        // position filter
        let found: Vec<_> = be
            .iter_relations_with_member(&pids, &a5, Some(1))
            .map(|e| (e.package_id, e.id))
            .collect();
        assert!(found.is_empty());

        be.insert_item("", "l1", &IdRef::imported("i1", "R3"), -1)
            .unwrap();
        let r3 = UriRef::new(P2_URI, "R3");
        let lists: Vec<_> = be
            .iter_lists_with_item(&pids, &r3, None)
            .map(|e| (e.package_id, e.id))
            .collect();
        assert_eq!(lists, vec![(String::new(), "l1".to_string())]);
    }

    #[test]
    fn test_iterator_stays_consistent_across_writes() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 10, 20).unwrap();
        be.create_annotation("", "a2", &IdRef::own("m1"), 30, 40).unwrap();

        let mut iter = be.iter_annotations(&[""], AnnotationFilter::default());
        let first = iter.next().unwrap();
        assert_eq!(first.id, "a1");

        // unrelated writes must not disturb the open iterator
        be.create_tag("", "t1").unwrap();
        be.create_annotation("", "a0", &IdRef::own("m1"), 0, 5).unwrap();
        be.delete_element("", "a2", ElementType::Annotation).unwrap();

        let rest: Vec<_> = iter.map(|e| e.id).collect();
        assert_eq!(rest, vec!["a2".to_string()]);

        // a fresh iterator sees the new state
        let now: Vec<_> = be
            .iter_annotations(&[""], AnnotationFilter::default())
            .map(|e| e.id)
            .collect();
        assert_eq!(now, vec!["a0".to_string(), "a1".to_string()]);
    }

    #[test]
    fn test_unconsumed_iterator_flushes_before_write() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 10, 20).unwrap();

        // not consumed at all before the write
        let iter = be.iter_annotations(&[""], AnnotationFilter::default());
        be.create_annotation("", "a0", &IdRef::own("m1"), 0, 5).unwrap();
        let ids: Vec<_> = iter.map(|e| e.id).collect();
        assert_eq!(ids, vec!["a1".to_string()]);
    }

    #[test]
    fn test_annotation_filters() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        // fixture: a5 10..20, a6 30..40 in P2; a1, a2 1..2 in ""
        let ids: Vec<_> = be
            .iter_annotations(
                &[P2],
                AnnotationFilter {
                    begin: TimeRange::between(Some(5), Some(15)),
                    ..Default::default()
                },
            )
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a5".to_string()]);

        let ids: Vec<_> = be
            .iter_annotations(
                &[P2],
                AnnotationFilter {
                    end: TimeRange::eq(40),
                    ..Default::default()
                },
            )
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a6".to_string()]);

        // media filter by absolute uri matches both the direct and the
        // imported spelling, and skips the i2 decoy
        let m3 = UriRef::new(P2_URI, "m3");
        let mut ids: Vec<_> = be
            .iter_annotations(
                &["", P2],
                AnnotationFilter {
                    media: UriMatch::Exact(&m3),
                    ..Default::default()
                },
            )
            .map(|e| e.id)
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec!["a1".to_string(), "a5".to_string(), "a6".to_string()]
        );

        let ids: Vec<_> = be
            .iter_annotations(
                &[""],
                AnnotationFilter {
                    id: Match::Exact("a2"),
                    ..Default::default()
                },
            )
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a2".to_string()]);
    }

    #[test]
    fn test_annotation_ordering() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_media("", "m2", "other.mp4").unwrap();
        be.create_annotation("", "b", &IdRef::own("m2"), 10, 20).unwrap();
        be.create_annotation("", "a", &IdRef::own("m1"), 10, 20).unwrap();
        be.create_annotation("", "c", &IdRef::own("m1"), 10, 15).unwrap();
        be.create_annotation("", "d", &IdRef::own("m1"), 5, 50).unwrap();
        let ids: Vec<_> = be
            .iter_annotations(&[""], AnnotationFilter::default())
            .map(|e| e.id)
            .collect();
        // ordered by (begin, end, media id-ref)
        assert_eq!(
            ids,
            vec![
                "d".to_string(),
                "c".to_string(),
                "a".to_string(),
                "b".to_string(),
            ]
        );
    }

    #[test]
    fn test_media_iter_filters() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_media("", "m2", "other.mp4").unwrap();
        let ids: Vec<_> = be
            .iter_medias(
                &[""],
                MediaFilter {
                    url: Match::Exact("other.mp4"),
                    ..Default::default()
                },
            )
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["m2".to_string()]);

        let ids: Vec<_> = be
            .iter_medias(
                &[""],
                MediaFilter {
                    id: Match::OneOf(&["m1", "m2"]),
                    ..Default::default()
                },
            )
            .map(|e| e.id)
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_simple_iters_and_imports() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        let tags: Vec<_> = be
            .iter_tags(&["", P2], ElementFilter::default())
            .map(|e| (e.package_id, e.id))
            .collect();
        assert_eq!(tags.len(), 2);

        let imports: Vec<_> = be
            .iter_imports(
                &[""],
                ImportFilter {
                    uri: Match::Exact(P2_URI),
                    ..Default::default()
                },
            )
            .collect();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].id, "i1");
        match &imports[0].data {
            ElementData::Import { uri, .. } => assert_eq!(uri, P2_URI),
            other => panic!("expected import, got {:?}", other),
        }
    }

    #[test]
    fn test_content_roundtrip() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_resource("", "R1").unwrap();
        be.create_view("", "v1").unwrap();
        be.update_content("", "v1", "text/html", "<b>hi</b>", Some(&IdRef::own("R1")))
            .unwrap();
        let content = be.get_content("", "v1").unwrap().unwrap();
        assert_eq!(content.mimetype, "text/html");
        assert_eq!(content.data, "<b>hi</b>");
        assert_eq!(content.schema, Some(IdRef::own("R1")));

        be.update_content("", "v1", "text/plain", "hi", None).unwrap();
        let content = be.get_content("", "v1").unwrap().unwrap();
        assert_eq!(content.schema, None);

        // medias carry no content
        be.create_media("", "m1", "movie.mp4").unwrap();
        assert!(be.get_content("", "m1").unwrap().is_none());
    }

    #[test]
    #[should_panic(expected = "has no content")]
    fn test_update_content_on_media_contract() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        let _ = be.update_content("", "m1", "text/plain", "x", None);
    }

    #[test]
    fn test_meta() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_tag("", "t1").unwrap();
        be.set_meta("", "t1", "dc:creator", Some("pa")).unwrap();
        be.set_meta("", "t1", "dc:title", Some("old")).unwrap();
        be.set_meta("", "t1", "dc:title", Some("new")).unwrap();
        // package-level metadata uses the empty element id
        be.set_meta("", "", "dc:creator", Some("someone")).unwrap();

        assert_eq!(
            be.get_meta("", "t1", "dc:title").unwrap(),
            Some("new".to_string())
        );
        assert_eq!(be.get_meta("", "t1", "dc:absent").unwrap(), None);
        assert_eq!(
            be.get_meta("", "", "dc:creator").unwrap(),
            Some("someone".to_string())
        );

        let all: Vec<_> = be.iter_meta("", "t1").collect();
        assert_eq!(
            all,
            vec![
                ("dc:creator".to_string(), "pa".to_string()),
                ("dc:title".to_string(), "new".to_string()),
            ]
        );

        be.set_meta("", "t1", "dc:title", None).unwrap();
        assert_eq!(be.get_meta("", "t1", "dc:title").unwrap(), None);
    }

    #[test]
    fn test_update_media_and_annotation() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_media("", "m2", "other.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 0, 10).unwrap();

        be.update_media("", "m1", "remastered.mp4").unwrap();
        assert_eq!(
            be.get_element("", "m1").unwrap().unwrap().data,
            ElementData::Media {
                url: "remastered.mp4".to_string()
            }
        );

        be.update_annotation("", "a1", &IdRef::own("m2"), 5, 15).unwrap();
        assert_eq!(
            be.get_element("", "a1").unwrap().unwrap().data,
            ElementData::Annotation {
                media: IdRef::own("m2"),
                begin: 5,
                end: 15,
            }
        );
    }

    #[test]
    fn test_rename_element_rewrites_own_rows() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "aX", &IdRef::own("m1"), 1, 2).unwrap();
        be.update_content("", "aX", "text/plain", "aX data", None).unwrap();
        be.set_meta("", "aX", "dc:title", Some("x")).unwrap();

        be.rename_element("", "aX", ElementType::Annotation, "aY").unwrap();
        assert!(!be.has_element("", "aX", None).unwrap());
        let e = be.get_element("", "aY").unwrap().unwrap();
        assert_eq!(e.element_type(), ElementType::Annotation);
        assert_eq!(be.get_content("", "aY").unwrap().unwrap().data, "aX data");
        assert_eq!(
            be.get_meta("", "aY", "dc:title").unwrap(),
            Some("x".to_string())
        );

        // relation rename keeps its members
        be.create_relation("", "rX").unwrap();
        be.insert_member("", "rX", &IdRef::own("aY"), -1).unwrap();
        be.rename_element("", "rX", ElementType::Relation, "rY").unwrap();
        assert_eq!(be.get_member("", "rY", 0).unwrap(), IdRef::own("aY"));

        // the old id is free again
        be.create_relation("", "rX").unwrap();
    }

    #[test]
    fn test_rename_to_taken_id_is_model_error() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_tag("", "t1").unwrap();
        be.create_tag("", "t2").unwrap();
        match be.rename_element("", "t1", ElementType::Tag, "t2") {
            Err(Error::IdInUse(id)) => assert_eq!(id, "t2"),
            other => panic!("expected IdInUse, got {:?}", other),
        }
        assert!(be.has_element("", "t1", Some(ElementType::Tag)).unwrap());
    }

    #[test]
    fn test_rename_references_propagates() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        be.insert_member(P2, "r3", &IdRef::own("a5"), -1).unwrap();
        be.insert_member("", "r1", &IdRef::imported("i1", "a5"), -1)
            .unwrap();
        be.insert_member("", "r1", &IdRef::imported("i2", "a5"), -1)
            .unwrap(); // trap
        be.associate_tag("", &IdRef::imported("i1", "a5"), &IdRef::own("t1"))
            .unwrap();

        be.rename_element(P2, "a5", ElementType::Annotation, "renamed")
            .unwrap();
        be.rename_references(&["", P2], &UriRef::new(P2_URI, "a5"), "renamed")
            .unwrap();

        assert_eq!(be.get_member(P2, "r3", 0).unwrap(), IdRef::own("renamed"));
        assert_eq!(
            be.get_member("", "r1", 0).unwrap(),
            IdRef::imported("i1", "renamed")
        );
        // the i2 alias points to a different package and must not change
        assert_eq!(
            be.get_member("", "r1", 1).unwrap(),
            IdRef::imported("i2", "a5")
        );
        // tag association followed the rename
        let renamed = UriRef::new(P2_URI, "renamed");
        let tags: Vec<_> = be.iter_tags_with_element(&[""], &renamed).collect();
        assert_eq!(tags, vec![(String::new(), IdRef::own("t1"))]);
    }

    #[test]
    fn test_rename_references_media_refs() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        // a1 refs i1:m3, a2 refs i2:m3 (trap), a5/a6 ref m3 directly
        be.rename_element(P2, "m3", ElementType::Media, "renamed")
            .unwrap();
        be.rename_references(&["", P2], &UriRef::new(P2_URI, "m3"), "renamed")
            .unwrap();

        let media_of = |pkg: &str, id: &str| match be.get_element(pkg, id).unwrap().unwrap().data {
            ElementData::Annotation { media, .. } => media,
            other => panic!("expected annotation, got {:?}", other),
        };
        assert_eq!(media_of("", "a1"), IdRef::imported("i1", "renamed"));
        assert_eq!(media_of("", "a2"), IdRef::imported("i2", "m3"));
        assert_eq!(media_of(P2, "a5"), IdRef::own("renamed"));
        assert_eq!(media_of(P2, "a6"), IdRef::own("renamed"));

        // restricting the package list restricts the rewrite
        be.rename_element(P2, "renamed", ElementType::Media, "foo")
            .unwrap();
        be.rename_references(&[P2], &UriRef::new(P2_URI, "renamed"), "foo")
            .unwrap();
        assert_eq!(media_of("", "a1"), IdRef::imported("i1", "renamed"));
        assert_eq!(media_of(P2, "a5"), IdRef::own("foo"));
    }

    #[test]
    fn test_rename_references_schema_refs() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        be.create_view("", "v1").unwrap();
        be.update_content("", "v1", "text/plain", "", Some(&IdRef::imported("i1", "R3")))
            .unwrap();
        be.rename_element(P2, "R3", ElementType::Resource, "schema2")
            .unwrap();
        be.rename_references(&["", P2], &UriRef::new(P2_URI, "R3"), "schema2")
            .unwrap();
        assert_eq!(
            be.get_content("", "v1").unwrap().unwrap().schema,
            Some(IdRef::imported("i1", "schema2"))
        );
    }

    #[test]
    fn test_rename_import_rewrites_prefixes() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        be.insert_member("", "r1", &IdRef::imported("i1", "a5"), -1)
            .unwrap();
        be.insert_item("", "l1", &IdRef::imported("i1", "R3"), -1)
            .unwrap();
        be.update_content("", "a1", "text/plain", "", Some(&IdRef::imported("i1", "R3")))
            .unwrap();
        be.associate_tag("", &IdRef::imported("i1", "a5"), &IdRef::imported("i1", "t3"))
            .unwrap();

        be.rename_element("", "i1", ElementType::Import, "j1").unwrap();

        assert!(!be.has_element("", "i1", None).unwrap());
        let e = be.get_element("", "j1").unwrap().unwrap();
        assert_eq!(e.element_type(), ElementType::Import);
        // every reference through the import now uses the new prefix
        match be.get_element("", "a1").unwrap().unwrap().data {
            ElementData::Annotation { media, .. } => {
                assert_eq!(media, IdRef::imported("j1", "m3"))
            }
            other => panic!("expected annotation, got {:?}", other),
        }
        assert_eq!(
            be.get_member("", "r1", 0).unwrap(),
            IdRef::imported("j1", "a5")
        );
        assert_eq!(
            be.get_item("", "l1", 0).unwrap(),
            IdRef::imported("j1", "R3")
        );
        assert_eq!(
            be.get_content("", "a1").unwrap().unwrap().schema,
            Some(IdRef::imported("j1", "R3"))
        );
        // tag rows updated on both sides, still resolvable by uri
        let a5 = UriRef::new(P2_URI, "a5");
        let tags: Vec<_> = be.iter_tags_with_element(&[""], &a5).collect();
        assert_eq!(tags, vec![(String::new(), IdRef::imported("j1", "t3"))]);
    }

    #[test]
    fn test_delete_element() {
        let (_dir, h) = open_store();
        let be = h.backend();
        be.create_media("", "m1", "movie.mp4").unwrap();
        be.create_annotation("", "a1", &IdRef::own("m1"), 0, 1).unwrap();
        be.set_meta("", "a1", "dc:title", Some("x")).unwrap();

        be.delete_element("", "a1", ElementType::Annotation).unwrap();
        assert!(be.get_element("", "a1").unwrap().is_none());
        assert!(be.get_content("", "a1").unwrap().is_none());
        assert_eq!(be.get_meta("", "a1", "dc:title").unwrap(), None);

        // the id can be reused, including with another kind
        be.create_tag("", "a1").unwrap();

        // deleting a relation drops its member rows
        be.create_annotation("", "a2", &IdRef::own("m1"), 0, 1).unwrap();
        be.create_relation("", "r1").unwrap();
        be.insert_member("", "r1", &IdRef::own("a2"), -1).unwrap();
        be.delete_element("", "r1", ElementType::Relation).unwrap();
        assert_eq!(be.count_members("", "r1").unwrap(), 0);
    }

    #[test]
    fn test_package_uri_and_stats() {
        let (_dir, h1, _h2) = open_two();
        let be = h1.backend();
        assert_eq!(be.get_uri(P2).unwrap(), P2_URI);
        assert_eq!(be.get_uri("").unwrap(), "");
        assert!(matches!(
            be.get_uri("nope"),
            Err(Error::NoSuchPackage(_))
        ));

        let stats = be.stats().unwrap();
        assert_eq!(stats.packages, 2);
        assert_eq!(stats.medias, 2);
        assert_eq!(stats.annotations, 4);
        assert_eq!(stats.imports, 2);
        assert_eq!(stats.tags, 2);

        assert_eq!(be.packages().unwrap(), vec!["".to_string(), P2.to_string()]);
    }

    #[test]
    fn test_delete_package() {
        let (_dir, h1, h2) = open_two();
        let be = h1.backend();
        // bound packages cannot be deleted
        assert!(matches!(be.delete(P2), Err(Error::PackageInUse(_))));
        h2.close().unwrap();
        h1.backend().delete(P2).unwrap();
        assert!(!h1.backend().contains_package(P2).unwrap());
        let stats = h1.backend().stats().unwrap();
        assert_eq!(stats.packages, 1);
        assert_eq!(stats.annotations, 2);
        assert!(matches!(
            h1.backend().delete(P2),
            Err(Error::NoSuchPackage(_))
        ));
    }
}
