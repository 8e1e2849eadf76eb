// src/lib.rs

//! berth - package transaction resolution
//!
//! berth turns package requests into solved, ordered transactions against a
//! local package database and remote repository catalogs. It covers the
//! resolution half of a package manager: upgrade predicates, dependency
//! fan-out, delete cascades, orphan detection, constraint solving, file
//! conflict handling, and download accounting. Executing the resulting
//! steps on the filesystem is left to a caller-supplied executor.
//!
//! # Architecture
//!
//! - Database-first: installed packages and repository catalogs live in
//!   SQLite, loaded on demand with per-query attribute flags
//! - Universe: every package variant a transaction touches, arena-allocated
//!   and chained by uid
//! - Requests: the add and delete sets a solve expands and the solver
//!   decides over
//! - Solved jobs: an ordered step list (deletes dependents-first, installs
//!   dependencies-first) ready for an executor

pub mod db;
pub mod diff;
mod error;
pub mod jobs;
pub mod package;
pub mod pattern;
pub mod shlibs;
pub mod version;

pub use db::PackageDb;
pub use error::{Error, Result};
pub use jobs::fetch::Fetcher;
pub use jobs::universe::{PkgId, Universe};
pub use jobs::{
    Executor, JobFlags, JobType, Jobs, JobsConfig, PackageFileLoader, SolvedJob, SolvedKind,
};
pub use package::{Dep, LoadFlags, Package, PkgType};
pub use pattern::{JobPattern, MatchMode};
pub use shlibs::{scan_system_shlibs, SystemShlibs};
pub use version::version_cmp;
