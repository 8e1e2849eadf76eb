// src/db/schema.rs

//! Database schema definitions and migrations
//!
//! One SQLite database holds the locally installed packages and any remote
//! catalogs mirrored into it. Every row in `packages` is a package variant;
//! the attribute tables hang off it by id.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Core tables:
/// - packages: one row per variant (installed, or remote per repository)
/// - deps: direct dependency edges
/// - pkg_strings: provides/requires/shlibs/conflicts/options, tagged by kind
/// - annotations: free-form key/value metadata
/// - files: installed or packaged paths
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uid TEXT NOT NULL,
            name TEXT NOT NULL,
            origin TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL,
            abi TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL CHECK(type IN ('installed', 'remote', 'file')),
            reponame TEXT,
            repopath TEXT,
            digest TEXT,
            automatic INTEGER NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            vital INTEGER NOT NULL DEFAULT 0,
            pkgsize INTEGER NOT NULL DEFAULT 0,
            flatsize INTEGER NOT NULL DEFAULT 0,
            UNIQUE(uid, version, type, reponame)
        );

        CREATE INDEX idx_packages_uid ON packages(uid);
        CREATE INDEX idx_packages_name ON packages(name);
        CREATE INDEX idx_packages_type ON packages(type);
        CREATE INDEX idx_packages_repo ON packages(reponame);

        -- Direct dependency edges; reverse edges are answered by querying
        -- this table from the other end
        CREATE TABLE deps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            origin TEXT NOT NULL DEFAULT '',
            uid TEXT NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_deps_package_id ON deps(package_id);
        CREATE INDEX idx_deps_uid ON deps(uid);

        -- List attributes, discriminated by kind
        CREATE TABLE pkg_strings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN (
                'provide', 'require',
                'shlib_provided', 'shlib_required',
                'conflict', 'option'
            )),
            value TEXT NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_pkg_strings_package_id ON pkg_strings(package_id);
        CREATE INDEX idx_pkg_strings_kind_value ON pkg_strings(kind, value);

        CREATE TABLE annotations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(package_id, tag),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE TABLE files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_files_package_id ON files(package_id);
        CREATE INDEX idx_files_path ON files(path);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"packages".to_string()));
        assert!(tables.contains(&"deps".to_string()));
        assert!(tables.contains(&"pkg_strings".to_string()));
        assert!(tables.contains(&"annotations".to_string()));
        assert!(tables.contains(&"files".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_packages_unique_per_repo() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO packages (uid, name, version, type, reponame)
             VALUES (?1, ?1, ?2, 'remote', ?3)",
            ["curl", "8.6.0", "primary"],
        )
        .unwrap();

        // Same variant in another repository is fine
        conn.execute(
            "INSERT INTO packages (uid, name, version, type, reponame)
             VALUES (?1, ?1, ?2, 'remote', ?3)",
            ["curl", "8.6.0", "mirror"],
        )
        .unwrap();

        // Duplicate within the same repository is not
        let result = conn.execute(
            "INSERT INTO packages (uid, name, version, type, reponame)
             VALUES (?1, ?1, ?2, 'remote', ?3)",
            ["curl", "8.6.0", "primary"],
        );
        assert!(result.is_err());
    }
}
