// src/db/mod.rs

//! Package database access
//!
//! [`PackageDb`] wraps one SQLite connection holding the installed packages
//! and the mirrored remote catalogs. Queries state which attribute groups
//! they need through [`LoadFlags`]; exact and all matches are pushed down
//! into SQL while glob and regex patterns are filtered in Rust.

pub mod schema;

use crate::error::{Error, Result};
use crate::package::{Dep, LoadFlags, Package, PkgType};
use crate::pattern::MatchMode;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Handle to the package database
pub struct PackageDb {
    conn: Connection,
    /// Held advisory lock, released on drop
    lock: Option<File>,
    lock_path: Option<PathBuf>,
}

impl PackageDb {
    /// Open (and migrate) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            lock: None,
            lock_path: Some(path.with_extension("lock")),
        })
    }

    /// In-memory database, used by tests and dry runs against fixtures
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            lock: None,
            lock_path: None,
        })
    }

    /// Take the exclusive advisory lock guarding mutations.
    ///
    /// No-op for in-memory databases. Blocks until the lock is granted.
    pub fn lock_exclusive(&mut self) -> Result<()> {
        let Some(path) = &self.lock_path else {
            return Ok(());
        };
        if self.lock.is_some() {
            return Ok(());
        }
        let f = File::create(path)?;
        f.lock_exclusive()?;
        debug!("acquired exclusive lock on {}", path.display());
        self.lock = Some(f);
        Ok(())
    }

    pub fn unlock(&mut self) {
        if let Some(f) = self.lock.take() {
            let _ = FileExt::unlock(&f);
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Store one package variant with all of its attributes
    pub fn insert_package(&self, pkg: &Package) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO packages (uid, name, origin, version, abi, type, reponame,
                                   repopath, digest, automatic, locked, vital,
                                   pkgsize, flatsize)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                &pkg.uid,
                &pkg.name,
                &pkg.origin,
                &pkg.version,
                &pkg.abi,
                pkg.pkg_type.as_str(),
                &pkg.reponame,
                &pkg.repopath,
                &pkg.digest,
                pkg.automatic,
                pkg.locked,
                pkg.vital,
                pkg.pkgsize,
                pkg.flatsize,
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        for dep in &pkg.deps {
            self.conn.execute(
                "INSERT INTO deps (package_id, name, origin, uid) VALUES (?1, ?2, ?3, ?4)",
                params![id, &dep.name, &dep.origin, &dep.uid],
            )?;
        }
        self.insert_strings(id, "provide", &pkg.provides)?;
        self.insert_strings(id, "require", &pkg.requires)?;
        self.insert_strings(id, "shlib_provided", &pkg.shlibs_provided)?;
        self.insert_strings(id, "shlib_required", &pkg.shlibs_required)?;
        self.insert_strings(id, "conflict", &pkg.conflicts)?;
        self.insert_strings(id, "option", &pkg.options)?;
        for (tag, value) in &pkg.annotations {
            self.conn.execute(
                "INSERT INTO annotations (package_id, tag, value) VALUES (?1, ?2, ?3)",
                params![id, tag, value],
            )?;
        }
        for path in &pkg.files {
            self.conn.execute(
                "INSERT INTO files (package_id, path) VALUES (?1, ?2)",
                params![id, path],
            )?;
        }

        Ok(id)
    }

    fn insert_strings(&self, id: i64, kind: &str, values: &[String]) -> Result<()> {
        for v in values {
            self.conn.execute(
                "INSERT INTO pkg_strings (package_id, kind, value) VALUES (?1, ?2, ?3)",
                params![id, kind, v],
            )?;
        }
        Ok(())
    }

    /// The installed variant for a uid, if any
    pub fn get_local(&self, uid: &str, flags: LoadFlags) -> Result<Option<Package>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE type = 'installed' AND uid = ?1",
            SELECT_PACKAGE
        ))?;
        let row = stmt.query_row([uid], row_to_package).optional()?;
        match row {
            Some((id, mut pkg)) => {
                self.load_attributes(id, &mut pkg, flags)?;
                Ok(Some(pkg))
            }
            None => Ok(None),
        }
    }

    /// Installed packages matching a pattern
    pub fn query_local(
        &self,
        pattern: &str,
        mode: MatchMode,
        flags: LoadFlags,
    ) -> Result<Vec<Package>> {
        self.query_packages(pattern, mode, None, true, flags)
    }

    /// Remote candidates matching a pattern, optionally pinned to one
    /// repository. Naming a repository that holds no catalog rows is an
    /// error rather than an empty result.
    pub fn query_remote(
        &self,
        pattern: &str,
        mode: MatchMode,
        reponame: Option<&str>,
        flags: LoadFlags,
    ) -> Result<Vec<Package>> {
        if let Some(repo) = reponame {
            if !self.has_repository(repo)? {
                return Err(Error::UnknownRepository(repo.to_string()));
            }
        }
        self.query_packages(pattern, mode, reponame, false, flags)
    }

    fn query_packages(
        &self,
        pattern: &str,
        mode: MatchMode,
        reponame: Option<&str>,
        local: bool,
        flags: LoadFlags,
    ) -> Result<Vec<Package>> {
        let type_clause = if local {
            "type = 'installed'"
        } else {
            "type = 'remote'"
        };

        let mut sql = format!("{SELECT_PACKAGE} WHERE {type_clause}");
        if reponame.is_some() {
            sql.push_str(" AND reponame = :repo");
        }
        match mode {
            MatchMode::Exact => sql.push_str(" AND (name = :pat OR uid = :pat)"),
            MatchMode::Internal => sql.push_str(" AND uid = :pat"),
            // Glob and regex rows are filtered after the scan
            MatchMode::All | MatchMode::Glob | MatchMode::Regex => {}
        }
        sql.push_str(" ORDER BY name, version");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        if matches!(mode, MatchMode::Exact | MatchMode::Internal) {
            named.push((":pat", &pattern));
        }
        if let Some(repo) = &reponame {
            named.push((":repo", repo));
        }

        let rows = stmt
            .query_map(named.as_slice(), row_to_package)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for (id, mut pkg) in rows {
            if matches!(mode, MatchMode::Glob | MatchMode::Regex)
                && !mode.matches(pattern, &pkg.name)
                && !mode.matches(pattern, &pkg.uid)
            {
                continue;
            }
            self.load_attributes(id, &mut pkg, flags)?;
            out.push(pkg);
        }
        Ok(out)
    }

    /// All installed packages
    pub fn all_local(&self, flags: LoadFlags) -> Result<Vec<Package>> {
        self.query_local("", MatchMode::All, flags)
    }

    /// Number of installed packages
    pub fn count_local(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM packages WHERE type = 'installed'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Installed packages that directly depend on `uid`
    pub fn rdeps_of(&self, uid: &str, flags: LoadFlags) -> Result<Vec<Package>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_PACKAGE} WHERE type = 'installed' AND id IN
                 (SELECT package_id FROM deps WHERE uid = ?1)
             ORDER BY name"
        ))?;
        let rows = stmt
            .query_map([uid], row_to_package)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::new();
        for (id, mut pkg) in rows {
            self.load_attributes(id, &mut pkg, flags)?;
            out.push(pkg);
        }
        Ok(out)
    }

    /// Installed packages whose require or shlib-required lists name `value`
    pub fn local_requiring(&self, value: &str, flags: LoadFlags) -> Result<Vec<Package>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_PACKAGE} WHERE type = 'installed' AND id IN
                 (SELECT package_id FROM pkg_strings
                  WHERE kind IN ('require', 'shlib_required') AND value = ?1)
             ORDER BY name"
        ))?;
        let rows = stmt
            .query_map([value], row_to_package)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::new();
        for (id, mut pkg) in rows {
            self.load_attributes(id, &mut pkg, flags)?;
            out.push(pkg);
        }
        Ok(out)
    }

    /// Installed packages whose provide or shlib-provided lists name `value`
    pub fn local_providing(&self, value: &str, flags: LoadFlags) -> Result<Vec<Package>> {
        self.providing(value, true, flags)
    }

    /// Remote candidates whose provide or shlib-provided lists name `value`
    pub fn remote_providing(&self, value: &str, flags: LoadFlags) -> Result<Vec<Package>> {
        self.providing(value, false, flags)
    }

    fn providing(&self, value: &str, local: bool, flags: LoadFlags) -> Result<Vec<Package>> {
        let type_clause = if local {
            "type = 'installed'"
        } else {
            "type = 'remote'"
        };
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_PACKAGE} WHERE {type_clause} AND id IN
                 (SELECT package_id FROM pkg_strings
                  WHERE kind IN ('provide', 'shlib_provided') AND value = ?1)
             ORDER BY name, version"
        ))?;
        let rows = stmt
            .query_map([value], row_to_package)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::new();
        for (id, mut pkg) in rows {
            self.load_attributes(id, &mut pkg, flags)?;
            out.push(pkg);
        }
        Ok(out)
    }

    /// Whether any installed package owns `path`
    pub fn file_exists(&self, path: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files f
             JOIN packages p ON p.id = f.package_id
             WHERE p.type = 'installed' AND f.path = ?1",
            [path],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// uids of installed packages owning `path`
    pub fn local_owners_of(&self, path: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.uid FROM files f
             JOIN packages p ON p.id = f.package_id
             WHERE p.type = 'installed' AND f.path = ?1",
        )?;
        let uids = stmt
            .query_map([path], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(uids)
    }

    /// File list recorded for a catalog entry, when the catalog carries one
    pub fn remote_files(&self, uid: &str, version: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.path FROM files f
             JOIN packages p ON p.id = f.package_id
             WHERE p.type = 'remote' AND p.uid = ?1 AND p.version = ?2
             ORDER BY f.path",
        )?;
        let paths = stmt
            .query_map(params![uid, version], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    /// Whether any catalog rows exist for `reponame`
    pub fn has_repository(&self, reponame: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM packages WHERE type = 'remote' AND reponame = ?1",
            [reponame],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Flip the automatic flag on an installed package
    pub fn set_automatic(&self, uid: &str, automatic: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE packages SET automatic = ?2 WHERE type = 'installed' AND uid = ?1",
            params![uid, automatic],
        )?;
        Ok(())
    }
}

impl Drop for PackageDb {
    fn drop(&mut self) {
        self.unlock();
    }
}

const SELECT_PACKAGE: &str = "SELECT id, uid, name, origin, version, abi, type, reponame,
        repopath, digest, automatic, locked, vital, pkgsize, flatsize
 FROM packages";

fn row_to_package(row: &Row<'_>) -> rusqlite::Result<(i64, Package)> {
    let id: i64 = row.get(0)?;
    let type_str: String = row.get(6)?;
    let pkg_type = type_str.parse::<PkgType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;

    let uid: String = row.get(1)?;
    let version: String = row.get(4)?;
    let mut pkg = Package::new(&uid, &version, pkg_type);
    pkg.name = row.get(2)?;
    pkg.origin = row.get(3)?;
    pkg.abi = row.get(5)?;
    pkg.reponame = row.get(7)?;
    pkg.repopath = row.get(8)?;
    pkg.digest = row.get(9)?;
    pkg.automatic = row.get(10)?;
    pkg.locked = row.get(11)?;
    pkg.vital = row.get(12)?;
    pkg.pkgsize = row.get(13)?;
    pkg.flatsize = row.get(14)?;
    Ok((id, pkg))
}

impl PackageDb {
    fn load_attributes(&self, id: i64, pkg: &mut Package, flags: LoadFlags) -> Result<()> {
        if flags.contains(LoadFlags::DEPS) {
            let mut stmt = self
                .conn
                .prepare("SELECT name, origin, uid FROM deps WHERE package_id = ?1 ORDER BY name")?;
            pkg.deps = stmt
                .query_map([id], |row| {
                    Ok(Dep {
                        name: row.get(0)?,
                        origin: row.get(1)?,
                        uid: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }
        if flags.contains(LoadFlags::RDEPS) {
            let mut stmt = self.conn.prepare(
                "SELECT p.name, p.origin, p.uid FROM deps d
                 JOIN packages p ON p.id = d.package_id
                 WHERE p.type = 'installed' AND d.uid = ?1 ORDER BY p.name",
            )?;
            pkg.rdeps = stmt
                .query_map([&pkg.uid], |row| {
                    Ok(Dep {
                        name: row.get(0)?,
                        origin: row.get(1)?,
                        uid: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }
        if flags.contains(LoadFlags::PROVIDES) {
            pkg.provides = self.load_strings(id, "provide")?;
        }
        if flags.contains(LoadFlags::REQUIRES) {
            pkg.requires = self.load_strings(id, "require")?;
        }
        if flags.contains(LoadFlags::SHLIBS) {
            pkg.shlibs_provided = self.load_strings(id, "shlib_provided")?;
            pkg.shlibs_required = self.load_strings(id, "shlib_required")?;
        }
        if flags.contains(LoadFlags::CONFLICTS) {
            pkg.conflicts = self.load_strings(id, "conflict")?;
        }
        if flags.contains(LoadFlags::OPTIONS) {
            pkg.options = self.load_strings(id, "option")?;
        }
        if flags.contains(LoadFlags::ANNOTATIONS) {
            let mut stmt = self.conn.prepare(
                "SELECT tag, value FROM annotations WHERE package_id = ?1 ORDER BY tag",
            )?;
            pkg.annotations = stmt
                .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }
        if flags.contains(LoadFlags::FILES) {
            let mut stmt = self
                .conn
                .prepare("SELECT path FROM files WHERE package_id = ?1 ORDER BY path")?;
            pkg.files = stmt
                .query_map([id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }
        Ok(())
    }

    fn load_strings(&self, id: i64, kind: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT value FROM pkg_strings WHERE package_id = ?1 AND kind = ?2 ORDER BY value",
        )?;
        let values = stmt
            .query_map(params![id, kind], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(uid: &str, version: &str) -> Package {
        Package::new(uid, version, PkgType::Installed)
    }

    fn remote(uid: &str, version: &str, repo: &str) -> Package {
        let mut p = Package::new(uid, version, PkgType::Remote);
        p.reponame = Some(repo.to_string());
        p
    }

    #[test]
    fn test_insert_and_get_local() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut pkg = installed("curl", "8.6.0");
        pkg.deps.push(Dep {
            name: "zlib".into(),
            origin: "devel/zlib".into(),
            uid: "zlib".into(),
        });
        pkg.shlibs_required.push("libz.so.6".into());
        pkg.files.push("/usr/local/bin/curl".into());
        db.insert_package(&pkg).unwrap();

        let loaded = db
            .get_local("curl", LoadFlags::DEPS | LoadFlags::SHLIBS | LoadFlags::FILES)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, "8.6.0");
        assert_eq!(loaded.deps.len(), 1);
        assert_eq!(loaded.shlibs_required, vec!["libz.so.6"]);
        assert_eq!(loaded.files, vec!["/usr/local/bin/curl"]);

        // Attributes not asked for stay empty
        let bare = db.get_local("curl", LoadFlags::BASIC).unwrap().unwrap();
        assert!(bare.deps.is_empty());
        assert!(bare.files.is_empty());
    }

    #[test]
    fn test_query_remote_by_glob() {
        let db = PackageDb::open_in_memory().unwrap();
        db.insert_package(&remote("py39-requests", "2.31.0", "primary"))
            .unwrap();
        db.insert_package(&remote("py39-urllib3", "2.2.0", "primary"))
            .unwrap();
        db.insert_package(&remote("curl", "8.6.0", "primary")).unwrap();

        let hits = db
            .query_remote("py39-*", MatchMode::Glob, None, LoadFlags::BASIC)
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_unknown_repository_is_an_error() {
        let db = PackageDb::open_in_memory().unwrap();
        db.insert_package(&remote("curl", "8.6.0", "primary")).unwrap();

        let err = db
            .query_remote("curl", MatchMode::Exact, Some("nope"), LoadFlags::BASIC)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRepository(_)));

        let hits = db
            .query_remote("curl", MatchMode::Exact, Some("primary"), LoadFlags::BASIC)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_rdeps_and_requiring() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut app = installed("app", "1.0");
        app.deps.push(Dep {
            name: "libfoo".into(),
            origin: "devel/libfoo".into(),
            uid: "libfoo".into(),
        });
        app.shlibs_required.push("libfoo.so.1".into());
        db.insert_package(&app).unwrap();
        db.insert_package(&installed("libfoo", "1.0")).unwrap();

        let rdeps = db.rdeps_of("libfoo", LoadFlags::BASIC).unwrap();
        assert_eq!(rdeps.len(), 1);
        assert_eq!(rdeps[0].uid, "app");

        let requiring = db.local_requiring("libfoo.so.1", LoadFlags::BASIC).unwrap();
        assert_eq!(requiring.len(), 1);
        assert_eq!(requiring[0].uid, "app");
    }

    #[test]
    fn test_file_ownership() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut pkg = installed("nginx", "1.24.0");
        pkg.files.push("/usr/local/sbin/nginx".into());
        db.insert_package(&pkg).unwrap();

        assert!(db.file_exists("/usr/local/sbin/nginx").unwrap());
        assert!(!db.file_exists("/usr/bin/uname").unwrap());
        assert_eq!(
            db.local_owners_of("/usr/local/sbin/nginx").unwrap(),
            vec!["nginx"]
        );
    }

    #[test]
    fn test_set_automatic() {
        let db = PackageDb::open_in_memory().unwrap();
        db.insert_package(&installed("dep", "1.0")).unwrap();
        db.set_automatic("dep", true).unwrap();
        let pkg = db.get_local("dep", LoadFlags::BASIC).unwrap().unwrap();
        assert!(pkg.automatic);
        assert_eq!(db.count_local().unwrap(), 1);
    }
}
