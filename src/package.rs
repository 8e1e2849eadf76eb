// src/package.rs

//! The package-variant record shared by the database, the universe, and the
//! solver. A variant is immutable once loaded apart from the bookkeeping
//! fields the resolution passes are allowed to stamp (`automatic`, `reason`).

use std::fmt;
use std::str::FromStr;

/// Where a package variant comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkgType {
    /// Present in the local package database
    Installed,
    /// Candidate from a remote repository catalog
    Remote,
    /// Supplied as a package file on disk or stdin
    File,
}

impl PkgType {
    pub fn as_str(&self) -> &str {
        match self {
            PkgType::Installed => "installed",
            PkgType::Remote => "remote",
            PkgType::File => "file",
        }
    }
}

impl FromStr for PkgType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "installed" => Ok(PkgType::Installed),
            "remote" => Ok(PkgType::Remote),
            "file" => Ok(PkgType::File),
            _ => Err(format!("Invalid package type: {s}")),
        }
    }
}

impl fmt::Display for PkgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute groups a database query may populate
///
/// Loading everything for every row is wasteful during candidate scans, so
/// queries state what they need, the way the loaders behind the package
/// database expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadFlags(u32);

impl LoadFlags {
    pub const BASIC: LoadFlags = LoadFlags(0);
    pub const DEPS: LoadFlags = LoadFlags(1 << 0);
    pub const RDEPS: LoadFlags = LoadFlags(1 << 1);
    pub const OPTIONS: LoadFlags = LoadFlags(1 << 2);
    pub const PROVIDES: LoadFlags = LoadFlags(1 << 3);
    pub const REQUIRES: LoadFlags = LoadFlags(1 << 4);
    pub const SHLIBS: LoadFlags = LoadFlags(1 << 5);
    pub const CONFLICTS: LoadFlags = LoadFlags(1 << 6);
    pub const ANNOTATIONS: LoadFlags = LoadFlags(1 << 7);
    pub const FILES: LoadFlags = LoadFlags(1 << 8);

    /// Everything the upgrade predicate and universe fan-out need
    pub const CANDIDATE: LoadFlags = LoadFlags(
        Self::DEPS.0
            | Self::OPTIONS.0
            | Self::PROVIDES.0
            | Self::REQUIRES.0
            | Self::SHLIBS.0
            | Self::CONFLICTS.0
            | Self::ANNOTATIONS.0,
    );

    /// Everything the delete cascade needs
    pub const DELETE: LoadFlags = LoadFlags(
        Self::DEPS.0 | Self::RDEPS.0 | Self::PROVIDES.0 | Self::SHLIBS.0 | Self::ANNOTATIONS.0,
    );

    pub fn contains(&self, other: LoadFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: LoadFlags) -> LoadFlags {
        LoadFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for LoadFlags {
    type Output = LoadFlags;

    fn bitor(self, rhs: LoadFlags) -> LoadFlags {
        self.union(rhs)
    }
}

/// A direct dependency edge as recorded in package metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dep {
    pub name: String,
    pub origin: String,
    pub uid: String,
}

/// One package variant: a specific (uid, version, origin) combination
#[derive(Debug, Clone)]
pub struct Package {
    pub uid: String,
    pub name: String,
    pub origin: String,
    pub version: String,
    pub abi: String,
    pub pkg_type: PkgType,
    /// Repository name for remote variants
    pub reponame: Option<String>,
    /// Catalog-relative path of the archive for remote variants
    pub repopath: Option<String>,
    pub digest: Option<String>,
    pub deps: Vec<Dep>,
    pub rdeps: Vec<Dep>,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    pub shlibs_provided: Vec<String>,
    pub shlibs_required: Vec<String>,
    /// uids of packages this variant conflicts with
    pub conflicts: Vec<String>,
    /// Build options as `key:value` pairs
    pub options: Vec<String>,
    pub annotations: Vec<(String, String)>,
    pub files: Vec<String>,
    pub automatic: bool,
    pub locked: bool,
    pub vital: bool,
    /// Archive size in bytes (remote variants)
    pub pkgsize: i64,
    /// Installed footprint in bytes
    pub flatsize: i64,
    /// Human-readable explanation stamped by the upgrade predicate or the
    /// deinstall-reason pass
    pub reason: Option<String>,
}

impl Package {
    pub fn new(uid: &str, version: &str, pkg_type: PkgType) -> Self {
        Self {
            uid: uid.to_string(),
            name: uid.to_string(),
            origin: String::new(),
            version: version.to_string(),
            abi: String::new(),
            pkg_type,
            reponame: None,
            repopath: None,
            digest: None,
            deps: Vec::new(),
            rdeps: Vec::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            shlibs_provided: Vec::new(),
            shlibs_required: Vec::new(),
            conflicts: Vec::new(),
            options: Vec::new(),
            annotations: Vec::new(),
            files: Vec::new(),
            automatic: false,
            locked: false,
            vital: false,
            pkgsize: 0,
            flatsize: 0,
            reason: None,
        }
    }

    /// Sort every list attribute that participates in set comparison.
    ///
    /// The upgrade predicate diffs these lists pairwise; both sides must be
    /// sorted before `stringlist_diff` sees them.
    pub fn sort_lists(&mut self) {
        self.provides.sort();
        self.requires.sort();
        self.shlibs_provided.sort();
        self.shlibs_required.sort();
        self.conflicts.sort();
        self.options.sort();
    }

    /// `name:origin` pairs of the direct dependencies, sorted
    pub fn dep_set(&self) -> Vec<String> {
        let mut v: Vec<String> = self
            .deps
            .iter()
            .map(|d| format!("{}:{}", d.name, d.origin))
            .collect();
        v.sort();
        v
    }

    /// Sorted conflict uids
    pub fn conflict_set(&self) -> Vec<String> {
        let mut v = self.conflicts.clone();
        v.sort();
        v
    }

    /// Sorted `key:value` option pairs
    pub fn option_set(&self) -> Vec<String> {
        let mut v = self.options.clone();
        v.sort();
        v
    }

    pub fn is_installed(&self) -> bool {
        self.pkg_type == PkgType::Installed
    }

    pub fn same_digest(&self, other: &Package) -> bool {
        match (&self.digest, &other.digest) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_flags_contains() {
        let flags = LoadFlags::DEPS | LoadFlags::SHLIBS;
        assert!(flags.contains(LoadFlags::DEPS));
        assert!(flags.contains(LoadFlags::BASIC));
        assert!(!flags.contains(LoadFlags::FILES));
        assert!(LoadFlags::CANDIDATE.contains(LoadFlags::CONFLICTS));
        assert!(LoadFlags::DELETE.contains(LoadFlags::RDEPS));
    }

    #[test]
    fn test_pkg_type_round_trip() {
        for t in [PkgType::Installed, PkgType::Remote, PkgType::File] {
            assert_eq!(t.as_str().parse::<PkgType>().unwrap(), t);
        }
        assert!("bogus".parse::<PkgType>().is_err());
    }

    #[test]
    fn test_dep_set_is_sorted() {
        let mut p = Package::new("app", "1.0", PkgType::Remote);
        p.deps.push(Dep {
            name: "zlib".into(),
            origin: "devel/zlib".into(),
            uid: "zlib".into(),
        });
        p.deps.push(Dep {
            name: "curl".into(),
            origin: "ftp/curl".into(),
            uid: "curl".into(),
        });
        assert_eq!(p.dep_set(), vec!["curl:ftp/curl", "zlib:devel/zlib"]);
    }

    #[test]
    fn test_same_digest_requires_both() {
        let mut a = Package::new("x", "1", PkgType::Installed);
        let mut b = Package::new("x", "1", PkgType::Remote);
        assert!(!a.same_digest(&b));
        a.digest = Some("abc".into());
        b.digest = Some("abc".into());
        assert!(a.same_digest(&b));
        b.digest = Some("def".into());
        assert!(!a.same_digest(&b));
    }
}
