// src/error.rs

use thiserror::Error;

/// Core error types for berth
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A repository name was requested that is not configured
    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    /// An install job was started without any patterns
    #[error("no patterns are specified for install job")]
    EmptyRequest,

    /// The job was already solved; its pattern list is frozen
    #[error("The job has already been solved. Impossible to append new elements")]
    AlreadySolved,

    /// An upgrade was requested for a package that is not installed
    #[error("{0} is not installed, therefore upgrade is impossible")]
    NotInstalled(String),

    /// A locked package blocks the requested operation
    #[error("{package} is locked, cannot proceed with {needed_by}")]
    Locked { package: String, needed_by: String },

    /// A non-forced delete hit a vital package
    #[error("Cannot delete vital package: {0}")]
    VitalPackage(String),

    /// A non-forced delete targeted the package manager itself
    #[error("Cannot delete {0} itself without force flag")]
    SelfRemoval(String),

    /// A package file could not be opened or failed validation
    #[error("cannot load {0}: invalid format")]
    InvalidPackageFile(String),

    /// No matching candidate was found in the repositories
    #[error("No packages available matching '{0}' have been found in the repositories")]
    NoCandidate(String),

    /// The constraint solver failed
    #[error("Solver error: {0}")]
    Solver(String),

    /// The external solver subprocess could not be spawned
    #[error("Failed to spawn external solver '{0}': {1}")]
    SolverSpawn(String, std::io::Error),

    /// File conflicts were registered during integrity checking
    #[error("{0} file conflicts registered in the job list")]
    ConflictsDetected(usize),

    /// The conflict discard-and-re-solve loop failed to converge
    #[error("conflict resolution did not converge after {0} attempts")]
    ConflictLoopDiverged(usize),

    /// The delete cascade failed to reach a fixed point
    #[error("delete cascade did not converge after {0} passes")]
    CascadeDidNotConverge(usize),

    /// Not enough room in the package cache for the pending downloads
    #[error("Not enough space in {cachedir}, needed {needed} available {available}")]
    InsufficientSpace {
        cachedir: String,
        needed: u64,
        available: u64,
    },

    /// Malformed version string
    #[error("Invalid version '{0}': {1}")]
    InvalidVersion(String, String),
}

/// Result type alias using berth's Error type
pub type Result<T> = std::result::Result<T, Error>;
