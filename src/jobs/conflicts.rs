// src/jobs/conflicts.rs

//! File-level conflict detection
//!
//! After solving, every to-be-installed package registers its paths; a path
//! claimed twice, or owned by an installed package that this transaction
//! neither removes nor replaces, is a conflict. Any registered conflict
//! discards the job list and forces a re-solve.

use crate::db::PackageDb;
use crate::error::Result;
use crate::jobs::universe::{PkgId, Universe};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// One detected file collision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub path: String,
    /// uid that registered the path first
    pub first: String,
    /// uid that collided with it
    pub second: String,
}

impl fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} conflicts with {} over {}",
            self.second, self.first, self.path
        )
    }
}

/// Register the file lists of all to-be-installed items and collect every
/// collision, both among the incoming packages and against installed
/// packages that survive the transaction (`going_away` holds the uids being
/// removed or replaced).
pub fn check_conflicts(
    db: &PackageDb,
    universe: &Universe,
    incoming: &[PkgId],
    going_away: &HashSet<String>,
) -> Result<Vec<ConflictInfo>> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    let mut conflicts = Vec::new();

    for &id in incoming {
        let pkg = universe.get(id);
        for path in &pkg.files {
            match owners.get(path.as_str()) {
                Some(&owner) if owner != pkg.uid => {
                    debug!("file conflict on {} between {} and {}", path, owner, pkg.uid);
                    conflicts.push(ConflictInfo {
                        path: path.clone(),
                        first: owner.to_string(),
                        second: pkg.uid.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    owners.insert(path, &pkg.uid);
                }
            }

            for local_owner in db.local_owners_of(path)? {
                if local_owner == pkg.uid || going_away.contains(&local_owner) {
                    continue;
                }
                debug!(
                    "file conflict on {} with installed {}",
                    path, local_owner
                );
                conflicts.push(ConflictInfo {
                    path: path.clone(),
                    first: local_owner,
                    second: pkg.uid.clone(),
                });
            }
        }
    }

    Ok(conflicts)
}
