// src/jobs/request.rs

//! Request tracker
//!
//! A [`Request`] maps uid to the universe items selected for one side of a
//! transaction. Each job carries two: the add-set (installs and upgrades)
//! and the delete-set (removals). Entries remember whether they were asked
//! for explicitly or pulled in by a cascade, and whether the delete cascade
//! has already expanded them.

use crate::error::Result;
use crate::jobs::universe::{PkgId, Universe};
use crate::package::Package;
use std::collections::HashMap;
use tracing::warn;

/// One candidate item inside a request entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestItem {
    pub pkg: PkgId,
    /// Index of the pattern that supplied this item as a package file
    pub from_file: Option<usize>,
}

/// All candidates requested for one uid
#[derive(Debug, Clone, Default)]
pub struct RequestEntry {
    pub items: Vec<RequestItem>,
    /// Cascade recursion guard
    pub processed: bool,
    /// Pulled in as a dependency rather than asked for by name
    pub automatic: bool,
}

/// uid → candidate list for one side (add or delete) of a job
#[derive(Debug, Default)]
pub struct Request {
    entries: HashMap<String, RequestEntry>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package, creating its universe item as a side effect.
    ///
    /// Locked packages are refused and reported, not treated as an error:
    /// the caller decides whether a skipped request matters. A duplicate
    /// insert reuses the existing request item rather than growing the
    /// entry.
    pub fn add(
        &mut self,
        universe: &mut Universe,
        pkg: Package,
        automatic: bool,
        force: bool,
    ) -> Result<Option<PkgId>> {
        if pkg.locked {
            warn!("{} is locked and cannot be requested", pkg);
            return Ok(None);
        }
        let uid = pkg.uid.clone();

        let id = universe.add_package(pkg, force)?.id();

        let entry = self.entries.entry(uid).or_insert_with(|| RequestEntry {
            automatic,
            ..Default::default()
        });
        if !automatic {
            entry.automatic = false;
        }
        if !entry.items.iter().any(|it| it.pkg == id) {
            entry.items.push(RequestItem {
                pkg: id,
                from_file: None,
            });
        }
        Ok(Some(id))
    }

    /// Build or extend an entry from an existing universe chain, keeping
    /// only members of the wanted origin kind.
    pub fn add_from_universe(
        &mut self,
        universe: &Universe,
        uid: &str,
        want_local: bool,
        automatic: bool,
    ) {
        let Some(chain) = universe.find(uid) else {
            return;
        };
        let wanted: Vec<PkgId> = chain
            .iter()
            .copied()
            .filter(|&id| universe.get(id).is_installed() == want_local)
            .collect();
        if wanted.is_empty() {
            return;
        }

        let entry = self
            .entries
            .entry(uid.to_string())
            .or_insert_with(|| RequestEntry {
                automatic,
                ..Default::default()
            });
        if !automatic {
            entry.automatic = false;
        }
        for id in wanted {
            if !entry.items.iter().any(|it| it.pkg == id) {
                entry.items.push(RequestItem {
                    pkg: id,
                    from_file: None,
                });
            }
        }
    }

    pub fn get(&self, uid: &str) -> Option<&RequestEntry> {
        self.entries.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut RequestEntry> {
        self.entries.get_mut(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn uids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &RequestEntry)> {
        self.entries.iter()
    }

    /// uids whose entries the cascade has not yet expanded
    pub fn unprocessed_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.processed)
            .map(|(uid, _)| uid.clone())
            .collect();
        uids.sort();
        uids
    }

    pub fn mark_processed(&mut self, uid: &str) {
        if let Some(entry) = self.entries.get_mut(uid) {
            entry.processed = true;
        }
    }

    pub fn remove(&mut self, uid: &str) -> Option<RequestEntry> {
        self.entries.remove(uid)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PkgType;

    fn remote(uid: &str, version: &str) -> Package {
        Package::new(uid, version, PkgType::Remote)
    }

    #[test]
    fn test_locked_package_is_refused() {
        let mut universe = Universe::new();
        let mut request = Request::new();
        let mut pkg = remote("curl", "8.6.0");
        pkg.locked = true;

        let added = request.add(&mut universe, pkg, false, false).unwrap();
        assert!(added.is_none());
        assert!(request.is_empty());
        assert!(universe.find("curl").is_none());
    }

    #[test]
    fn test_duplicate_add_reuses_item() {
        let mut universe = Universe::new();
        let mut request = Request::new();
        let mut a = remote("curl", "8.6.0");
        a.digest = Some("d1".into());
        let b = a.clone();

        let first = request.add(&mut universe, a, false, false).unwrap().unwrap();
        let second = request.add(&mut universe, b, false, false).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(request.get("curl").unwrap().items.len(), 1);
    }

    #[test]
    fn test_explicit_wins_over_automatic() {
        let mut universe = Universe::new();
        let mut request = Request::new();
        let mut a = remote("zlib", "1.3");
        a.digest = Some("d1".into());

        request.add(&mut universe, a.clone(), true, false).unwrap();
        assert!(request.get("zlib").unwrap().automatic);

        request.add(&mut universe, a, false, false).unwrap();
        assert!(!request.get("zlib").unwrap().automatic);
    }

    #[test]
    fn test_add_from_universe_filters_by_kind() {
        let mut universe = Universe::new();
        universe
            .add_package(Package::new("app", "1.0", PkgType::Installed), false)
            .unwrap();
        universe
            .add_package(Package::new("app", "1.1", PkgType::Remote), false)
            .unwrap();

        let mut request = Request::new();
        request.add_from_universe(&universe, "app", false, true);
        let entry = request.get("app").unwrap();
        assert_eq!(entry.items.len(), 1);
        assert!(!universe.get(entry.items[0].pkg).is_installed());
    }

    #[test]
    fn test_unprocessed_tracking() {
        let mut universe = Universe::new();
        let mut request = Request::new();
        request
            .add(&mut universe, remote("a", "1"), false, false)
            .unwrap();
        request
            .add(&mut universe, remote("b", "1"), false, false)
            .unwrap();

        assert_eq!(request.unprocessed_uids(), vec!["a", "b"]);
        request.mark_processed("a");
        assert_eq!(request.unprocessed_uids(), vec!["b"]);
    }
}
