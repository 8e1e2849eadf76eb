// src/jobs/universe.rs

//! Package universe
//!
//! The universe owns every package variant a transaction touches. Variants
//! live in an arena; all variants sharing one uid form a chain, indexed by
//! uid and iterated in append order. The chain is the unit of candidate
//! reasoning: at most one member may end up selected as the new state of an
//! upgrade, with the installed member as the old state.

use crate::db::PackageDb;
use crate::error::Result;
use crate::jobs::request::Request;
use crate::jobs::upgrade::needs_upgrade;
use crate::package::{LoadFlags, Package};
use crate::shlibs::SystemShlibs;
use crate::version::version_cmp;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Index of a package variant in the universe arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PkgId(pub usize);

/// Result of inserting a package into the universe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new chain node was created
    Inserted(PkgId),
    /// An equal variant already existed; no node was created
    DuplicateIgnored(PkgId),
}

impl AddOutcome {
    pub fn id(&self) -> PkgId {
        match self {
            AddOutcome::Inserted(id) | AddOutcome::DuplicateIgnored(id) => *id,
        }
    }
}

/// Arena of package variants plus the uid chain index
#[derive(Debug, Default)]
pub struct Universe {
    packages: Vec<Package>,
    chains: HashMap<String, Vec<PkgId>>,
    /// Attribute groups the installed variant of a uid was loaded with
    local_loaded: HashMap<String, LoadFlags>,
    /// Symbols already fanned out by `process`
    seen_symbols: HashSet<String>,
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PkgId) -> &Package {
        &self.packages[id.0]
    }

    pub fn get_mut(&mut self, id: PkgId) -> &mut Package {
        &mut self.packages[id.0]
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// The chain for a uid, in append order
    pub fn find(&self, uid: &str) -> Option<&[PkgId]> {
        self.chains.get(uid).map(|c| c.as_slice())
    }

    pub fn uids(&self) -> impl Iterator<Item = &String> {
        self.chains.keys()
    }

    /// Insert a package variant.
    ///
    /// A variant whose digest equals an existing chain member's, or a second
    /// installed variant for the same uid, is ignored and the existing item
    /// returned, unless `force` insists on a new node.
    pub fn add_package(&mut self, pkg: Package, force: bool) -> Result<AddOutcome> {
        if let Some(chain) = self.chains.get(&pkg.uid) {
            if !force {
                for &id in chain {
                    let existing = &self.packages[id.0];
                    if existing.same_digest(&pkg)
                        || (existing.is_installed() && pkg.is_installed())
                    {
                        debug!("universe: {} already present, reusing", pkg);
                        return Ok(AddOutcome::DuplicateIgnored(id));
                    }
                }
            }
        }

        let id = PkgId(self.packages.len());
        let uid = pkg.uid.clone();
        self.packages.push(pkg);
        self.chains.entry(uid).or_default().push(id);
        Ok(AddOutcome::Inserted(id))
    }

    /// The installed variant for a uid, loading it from the database on
    /// first use and caching it in the chain.
    ///
    /// A cached variant asked for with attribute groups it was not loaded
    /// with is reloaded in place with the union of the groups.
    pub fn get_local(
        &mut self,
        db: &PackageDb,
        uid: &str,
        flags: LoadFlags,
    ) -> Result<Option<PkgId>> {
        if let Some(id) = self.installed_member(uid) {
            if let Some(&have) = self.local_loaded.get(uid) {
                if !have.contains(flags) {
                    let want = have | flags;
                    if let Some(mut pkg) = db.get_local(uid, want)? {
                        pkg.sort_lists();
                        self.packages[id.0] = pkg;
                    }
                    self.local_loaded.insert(uid.to_string(), want);
                }
            }
            return Ok(Some(id));
        }
        if self.local_loaded.contains_key(uid) {
            return Ok(None);
        }
        self.local_loaded.insert(uid.to_string(), flags);

        match db.get_local(uid, flags)? {
            Some(pkg) => {
                let mut pkg = pkg;
                pkg.sort_lists();
                Ok(Some(self.add_package(pkg, false)?.id()))
            }
            None => Ok(None),
        }
    }

    /// The installed chain member for a uid, if any
    pub fn installed_member(&self, uid: &str) -> Option<PkgId> {
        self.chains
            .get(uid)?
            .iter()
            .copied()
            .find(|&id| self.packages[id.0].is_installed())
    }

    /// Non-installed chain members that qualify as upgrade targets for
    /// `local` under the upgrade-need predicate.
    ///
    /// With `exact_version` only an exact match qualifies; `force` skips
    /// the predicate entirely.
    pub fn get_upgrade_candidates(
        &mut self,
        uid: &str,
        local: Option<PkgId>,
        force: bool,
        exact_version: Option<&str>,
        shlibs: &SystemShlibs,
        reinstall_on_options_change: bool,
    ) -> Vec<PkgId> {
        let Some(chain) = self.chains.get(uid) else {
            return Vec::new();
        };
        let members: Vec<PkgId> = chain
            .iter()
            .copied()
            .filter(|&id| !self.packages[id.0].is_installed())
            .collect();
        let local_pkg = local.map(|id| self.packages[id.0].clone());

        let mut out = Vec::new();
        for id in members {
            if let Some(ver) = exact_version {
                if self.packages[id.0].version == ver {
                    out.push(id);
                }
                continue;
            }
            if force {
                self.packages[id.0].reason = Some("forced".to_string());
                out.push(id);
                continue;
            }
            match &local_pkg {
                None => {
                    self.packages[id.0].reason = Some("new".to_string());
                    out.push(id);
                }
                Some(local_pkg) => {
                    if needs_upgrade(
                        shlibs,
                        &mut self.packages[id.0],
                        local_pkg,
                        reinstall_on_options_change,
                    ) {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    /// Fan out from one variant over its dependencies, requirements, and
    /// conflicts, pulling everything transitively reachable into the
    /// universe. Remote dependencies without an installed counterpart
    /// become automatic add-requests.
    ///
    /// Cycle-safe: uids and symbols already visited short-circuit.
    pub fn process(
        &mut self,
        db: &PackageDb,
        start: PkgId,
        add_request: &mut Request,
    ) -> Result<()> {
        let mut worklist = vec![start];
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(self.packages[start.0].uid.clone());

        while let Some(id) = worklist.pop() {
            let pkg = self.packages[id.0].clone();
            debug!("universe: processing {}", pkg);

            for dep in &pkg.deps {
                self.fan_out_uid(db, &dep.uid, add_request, &mut visited, &mut worklist)?;
            }

            for symbol in pkg.requires.iter().chain(pkg.shlibs_required.iter()) {
                if !self.seen_symbols.insert(symbol.clone()) {
                    continue;
                }
                let local_providers = db.local_providing(symbol, LoadFlags::CANDIDATE)?;
                let have_local = !local_providers.is_empty();
                for provider in local_providers {
                    let uid = provider.uid.clone();
                    if visited.insert(uid.clone()) {
                        let added = self.add_package(provider, false)?.id();
                        worklist.push(added);
                    }
                }
                if !have_local {
                    for provider in db.remote_providing(symbol, LoadFlags::CANDIDATE)? {
                        let uid = provider.uid.clone();
                        let new = visited.insert(uid.clone());
                        let mut provider = provider;
                        provider.sort_lists();
                        let added = self.add_package(provider, false)?.id();
                        if new {
                            worklist.push(added);
                        }
                        add_request.add_from_universe(&*self, &uid, false, true);
                    }
                }
            }

            // Conflicting installed packages must be visible to the solver
            for conflict_uid in &pkg.conflicts {
                if visited.insert(conflict_uid.clone()) {
                    if let Some(local) = self.get_local(db, conflict_uid, LoadFlags::CANDIDATE)? {
                        worklist.push(local);
                    }
                }
            }
        }
        Ok(())
    }

    fn fan_out_uid(
        &mut self,
        db: &PackageDb,
        uid: &str,
        add_request: &mut Request,
        visited: &mut HashSet<String>,
        worklist: &mut Vec<PkgId>,
    ) -> Result<()> {
        if !visited.insert(uid.to_string()) {
            return Ok(());
        }
        let local = self.get_local(db, uid, LoadFlags::CANDIDATE)?;
        if let Some(id) = local {
            worklist.push(id);
        }
        let remotes = db.query_remote(
            uid,
            crate::pattern::MatchMode::Internal,
            None,
            LoadFlags::CANDIDATE,
        )?;
        let mut first_added = None;
        for mut remote in remotes {
            remote.sort_lists();
            let added = self.add_package(remote, false)?.id();
            first_added.get_or_insert(added);
        }
        if local.is_none() {
            if let Some(id) = first_added {
                worklist.push(id);
                add_request.add_from_universe(&*self, uid, false, true);
            }
        }
        Ok(())
    }

    /// Drop every non-installed member from a uid's chain.
    ///
    /// Used by the conflict loop to discard a candidate before re-solving.
    pub fn drop_candidates(&mut self, uid: &str) {
        if let Some(chain) = self.chains.get_mut(uid) {
            let packages = &self.packages;
            chain.retain(|&id| packages[id.0].is_installed());
        }
    }

    /// Narrow every multi-candidate chain to a single winner.
    ///
    /// The winner is the highest version; in conservative mode candidates
    /// from the repository the installed variant came from are preferred
    /// when any exist.
    pub fn process_upgrade_chains(&mut self, conservative: bool) {
        let uids: Vec<String> = self.chains.keys().cloned().collect();
        for uid in uids {
            let chain = &self.chains[&uid];
            let candidates: Vec<PkgId> = chain
                .iter()
                .copied()
                .filter(|&id| !self.packages[id.0].is_installed())
                .collect();
            if candidates.len() < 2 {
                continue;
            }

            let home_repo = self
                .installed_member(&uid)
                .and_then(|id| {
                    self.packages[id.0]
                        .annotations
                        .iter()
                        .find(|(tag, _)| tag == "repository")
                        .map(|(_, value)| value.clone())
                });

            let pool: Vec<PkgId> = if conservative {
                let same_repo: Vec<PkgId> = candidates
                    .iter()
                    .copied()
                    .filter(|&id| self.packages[id.0].reponame == home_repo)
                    .collect();
                if same_repo.is_empty() {
                    candidates.clone()
                } else {
                    same_repo
                }
            } else {
                candidates.clone()
            };

            let Some(winner) = pool.iter().copied().max_by(|&a, &b| {
                version_cmp(&self.packages[a.0].version, &self.packages[b.0].version)
            }) else {
                continue;
            };
            debug!(
                "universe: narrowed {} to {}",
                uid, self.packages[winner.0]
            );

            if let Some(chain) = self.chains.get_mut(&uid) {
                chain.retain(|&id| id == winner || !candidates.contains(&id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Dep, PkgType};

    fn pkg(uid: &str, version: &str, t: PkgType) -> Package {
        Package::new(uid, version, t)
    }

    #[test]
    fn test_chain_append_order() {
        let mut u = Universe::new();
        u.add_package(pkg("curl", "8.5.0", PkgType::Installed), false)
            .unwrap();
        u.add_package(pkg("curl", "8.6.0", PkgType::Remote), false)
            .unwrap();
        u.add_package(pkg("curl", "8.7.0", PkgType::Remote), false)
            .unwrap();

        let chain = u.find("curl").unwrap();
        let versions: Vec<&str> = chain
            .iter()
            .map(|&id| u.get(id).version.as_str())
            .collect();
        assert_eq!(versions, vec!["8.5.0", "8.6.0", "8.7.0"]);
    }

    #[test]
    fn test_duplicate_digest_is_ignored() {
        let mut u = Universe::new();
        let mut a = pkg("curl", "8.6.0", PkgType::Remote);
        a.digest = Some("abc".into());
        let b = a.clone();

        let first = u.add_package(a, false).unwrap();
        assert!(matches!(first, AddOutcome::Inserted(_)));
        let second = u.add_package(b, false).unwrap();
        assert_eq!(second, AddOutcome::DuplicateIgnored(first.id()));
        assert_eq!(u.find("curl").unwrap().len(), 1);
    }

    #[test]
    fn test_force_inserts_duplicate() {
        let mut u = Universe::new();
        let mut a = pkg("curl", "8.6.0", PkgType::Remote);
        a.digest = Some("abc".into());
        let b = a.clone();

        u.add_package(a, false).unwrap();
        let second = u.add_package(b, true).unwrap();
        assert!(matches!(second, AddOutcome::Inserted(_)));
        assert_eq!(u.find("curl").unwrap().len(), 2);
    }

    #[test]
    fn test_single_installed_variant_per_uid() {
        let mut u = Universe::new();
        let first = u
            .add_package(pkg("curl", "8.5.0", PkgType::Installed), false)
            .unwrap();
        let second = u
            .add_package(pkg("curl", "8.5.0_1", PkgType::Installed), false)
            .unwrap();
        assert_eq!(second, AddOutcome::DuplicateIgnored(first.id()));
    }

    #[test]
    fn test_get_local_loads_and_caches() {
        let db = PackageDb::open_in_memory().unwrap();
        db.insert_package(&pkg("curl", "8.5.0", PkgType::Installed))
            .unwrap();

        let mut u = Universe::new();
        let id = u.get_local(&db, "curl", LoadFlags::BASIC).unwrap().unwrap();
        assert!(u.get(id).is_installed());
        // Second lookup hits the chain, not the database
        let again = u.get_local(&db, "curl", LoadFlags::BASIC).unwrap().unwrap();
        assert_eq!(id, again);
        assert_eq!(u.find("curl").unwrap().len(), 1);

        assert!(u.get_local(&db, "absent", LoadFlags::BASIC).unwrap().is_none());
    }

    #[test]
    fn test_get_local_tops_up_attribute_groups() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut app = pkg("app", "1.0", PkgType::Installed);
        app.deps.push(Dep {
            name: "zlib".into(),
            origin: "devel/zlib".into(),
            uid: "zlib".into(),
        });
        db.insert_package(&app).unwrap();

        let mut u = Universe::new();
        let id = u.get_local(&db, "app", LoadFlags::BASIC).unwrap().unwrap();
        assert!(u.get(id).deps.is_empty());

        // A later caller asking for more groups gets them at the same id
        let again = u
            .get_local(&db, "app", LoadFlags::BASIC | LoadFlags::DEPS)
            .unwrap()
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(u.get(id).deps.len(), 1);
        assert_eq!(u.get(id).deps[0].uid, "zlib");
        assert_eq!(u.find("app").unwrap().len(), 1);
    }

    #[test]
    fn test_upgrade_candidates_respect_predicate() {
        let shlibs = SystemShlibs::default();
        let mut u = Universe::new();
        let mut local = pkg("curl", "8.5.0", PkgType::Installed);
        local.digest = Some("old".into());
        let local_id = u.add_package(local, false).unwrap().id();

        let mut newer = pkg("curl", "8.6.0", PkgType::Remote);
        newer.digest = Some("new".into());
        u.add_package(newer, false).unwrap();
        let mut same = pkg("curl", "8.5.0", PkgType::Remote);
        same.digest = Some("old".into());
        u.add_package(same, true).unwrap();

        let cands = u.get_upgrade_candidates("curl", Some(local_id), false, None, &shlibs, false);
        assert_eq!(cands.len(), 1);
        assert_eq!(u.get(cands[0]).version, "8.6.0");
        assert_eq!(u.get(cands[0]).reason.as_deref(), Some("new version"));
    }

    #[test]
    fn test_exact_version_narrows_candidates() {
        let shlibs = SystemShlibs::default();
        let mut u = Universe::new();
        u.add_package(pkg("curl", "8.6.0", PkgType::Remote), false)
            .unwrap();
        u.add_package(pkg("curl", "8.7.0", PkgType::Remote), true)
            .unwrap();

        let cands = u.get_upgrade_candidates("curl", None, false, Some("8.6.0"), &shlibs, false);
        assert_eq!(cands.len(), 1);
        assert_eq!(u.get(cands[0]).version, "8.6.0");
    }

    #[test]
    fn test_process_pulls_remote_deps_as_automatic() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut dep = pkg("zlib", "1.3", PkgType::Remote);
        dep.reponame = Some("primary".into());
        db.insert_package(&dep).unwrap();

        let mut u = Universe::new();
        let mut app = pkg("app", "1.0", PkgType::Remote);
        app.deps.push(Dep {
            name: "zlib".into(),
            origin: "devel/zlib".into(),
            uid: "zlib".into(),
        });
        let start = u.add_package(app, false).unwrap().id();

        let mut add_request = Request::new();
        u.process(&db, start, &mut add_request).unwrap();

        assert!(u.find("zlib").is_some());
        let entry = add_request.get("zlib").unwrap();
        assert!(entry.automatic);
    }

    #[test]
    fn test_process_is_cycle_safe() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut a = pkg("a", "1.0", PkgType::Remote);
        a.deps.push(Dep {
            name: "b".into(),
            origin: "misc/b".into(),
            uid: "b".into(),
        });
        let mut b = pkg("b", "1.0", PkgType::Remote);
        b.deps.push(Dep {
            name: "a".into(),
            origin: "misc/a".into(),
            uid: "a".into(),
        });
        db.insert_package(&a).unwrap();
        db.insert_package(&b).unwrap();

        let mut u = Universe::new();
        let start = u.add_package(a, false).unwrap().id();
        let mut add_request = Request::new();
        // Must terminate despite the a <-> b dependency cycle
        u.process(&db, start, &mut add_request).unwrap();
        assert!(u.find("b").is_some());
    }

    #[test]
    fn test_process_upgrade_chains_picks_highest() {
        let mut u = Universe::new();
        u.add_package(pkg("curl", "8.5.0", PkgType::Installed), false)
            .unwrap();
        u.add_package(pkg("curl", "8.6.0", PkgType::Remote), false)
            .unwrap();
        u.add_package(pkg("curl", "8.7.0", PkgType::Remote), true)
            .unwrap();

        u.process_upgrade_chains(false);
        let chain = u.find("curl").unwrap();
        assert_eq!(chain.len(), 2);
        let remote: Vec<&str> = chain
            .iter()
            .filter(|&&id| !u.get(id).is_installed())
            .map(|&id| u.get(id).version.as_str())
            .collect();
        assert_eq!(remote, vec!["8.7.0"]);
    }

    #[test]
    fn test_conservative_prefers_home_repository() {
        let mut u = Universe::new();
        let mut local = pkg("curl", "8.5.0", PkgType::Installed);
        local.annotations.push(("repository".into(), "primary".into()));
        u.add_package(local, false).unwrap();

        let mut mirror = pkg("curl", "8.7.0", PkgType::Remote);
        mirror.reponame = Some("mirror".into());
        u.add_package(mirror, false).unwrap();
        let mut primary = pkg("curl", "8.6.0", PkgType::Remote);
        primary.reponame = Some("primary".into());
        u.add_package(primary, true).unwrap();

        u.process_upgrade_chains(true);
        let chain = u.find("curl").unwrap();
        let remote: Vec<&str> = chain
            .iter()
            .filter(|&&id| !u.get(id).is_installed())
            .map(|&id| u.get(id).version.as_str())
            .collect();
        assert_eq!(remote, vec!["8.6.0"]);
    }
}
