// src/jobs/upgrade.rs

//! Upgrade-need predicate and candidate discovery
//!
//! `needs_upgrade` decides whether a remote variant replaces the installed
//! one and records a human-readable reason on the remote package. The
//! discovery half turns a pattern into registered upgrade candidates,
//! including the fallback that guesses a renamed candidate when the exact
//! name vanished from the repositories.

use crate::db::PackageDb;
use crate::diff::stringlist_diff;
use crate::error::Result;
use crate::jobs::request::Request;
use crate::jobs::universe::{PkgId, Universe};
use crate::package::{LoadFlags, Package};
use crate::pattern::MatchMode;
use crate::shlibs::SystemShlibs;
use crate::version::version_cmp;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Result of trying to register upgrade candidates for one pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// At least one candidate was added to the request
    Added,
    /// The repositories hold nothing newer than what is installed
    AlreadyInstalled,
    /// The local package is kept in the universe without candidates
    /// because installed packages still depend on it
    KeptLocal,
    /// Nothing matched
    NotFound,
}

/// Borrowed slice of the job state the discovery functions operate on
pub struct UpgradeCtx<'a> {
    pub db: &'a PackageDb,
    pub universe: &'a mut Universe,
    pub add_request: &'a mut Request,
    pub shlibs: &'a SystemShlibs,
    pub reponame: Option<&'a str>,
    pub force: bool,
    /// Job is an upgrade (as opposed to an install)
    pub is_upgrade: bool,
    /// Fetch jobs skip the local-package checks entirely
    pub is_fetch: bool,
    pub reinstall_on_options_change: bool,
}

fn sorted(list: &[String]) -> Vec<String> {
    let mut v = list.to_vec();
    v.sort();
    v
}

/// Decide whether `remote` should replace `local`.
///
/// First matching rule wins; a positive answer leaves the reason on
/// `remote.reason`. Identical digests are never an upgrade regardless of
/// any other field.
pub fn needs_upgrade(
    system_shlibs: &SystemShlibs,
    remote: &mut Package,
    local: &Package,
    reinstall_on_options_change: bool,
) -> bool {
    if local.locked {
        warn!("{} is locked and may not be upgraded", local);
        return false;
    }

    if local.same_digest(remote) {
        return false;
    }

    match version_cmp(&local.version, &remote.version) {
        Ordering::Greater => return false,
        Ordering::Less => {
            remote.reason = Some("new version".to_string());
            return true;
        }
        Ordering::Equal => {}
    }

    if local.abi != remote.abi {
        remote.reason = Some(format!(
            "ABI changed: '{}' -> '{}'",
            local.abi, remote.abi
        ));
        return true;
    }

    if reinstall_on_options_change {
        if let Some(rv) = stringlist_diff(&local.option_set(), &remote.option_set(), None) {
            remote.reason = Some(format!("options {rv}"));
            return true;
        }
    }

    if let Some(rv) = stringlist_diff(&local.dep_set(), &remote.dep_set(), None) {
        remote.reason = Some(format!("direct dependencies {rv}"));
        return true;
    }

    if let Some(rv) = stringlist_diff(&local.conflict_set(), &remote.conflict_set(), None) {
        remote.reason = Some(format!("direct conflicts {rv}"));
        return true;
    }

    if let Some(rv) = stringlist_diff(&sorted(&local.provides), &sorted(&remote.provides), None) {
        remote.reason = Some(format!("provides {rv}"));
        return true;
    }

    if let Some(rv) = stringlist_diff(&sorted(&local.requires), &sorted(&remote.requires), None) {
        remote.reason = Some(format!("requires {rv}"));
        return true;
    }

    if let Some(rv) = stringlist_diff(
        &sorted(&local.shlibs_provided),
        &sorted(&remote.shlibs_provided),
        None,
    ) {
        remote.reason = Some(format!("provided shared libraries {rv}"));
        return true;
    }

    let ignore = system_shlibs.ignore_set();
    if let Some(rv) = stringlist_diff(
        &sorted(&local.shlibs_required),
        &sorted(&remote.shlibs_required),
        Some(&ignore),
    ) {
        remote.reason = Some(format!("required shared libraries {rv}"));
        return true;
    }

    false
}

/// Register the upgrade candidates for one remote variant.
///
/// Returns `Added` when candidates entered the add-request, and
/// `AlreadyInstalled` when the local package already satisfies the request.
/// A locked local package aborts with [`crate::Error::Locked`].
pub fn process_remote_pkg(
    ctx: &mut UpgradeCtx<'_>,
    remote: Package,
    exact_version: bool,
) -> Result<CandidateOutcome> {
    let uid = remote.uid.clone();
    let version = remote.version.clone();

    let local = if ctx.is_fetch {
        None
    } else {
        ctx.universe.get_local(ctx.db, &uid, LoadFlags::CANDIDATE)?
    };
    if let Some(lid) = local {
        let lp = ctx.universe.get(lid);
        if lp.locked {
            return Err(crate::error::Error::Locked {
                package: lp.name.clone(),
                needed_by: uid,
            });
        }
    }

    let mut remote = remote;
    remote.sort_lists();
    ctx.universe.add_package(remote, false)?;

    let candidates = ctx.universe.get_upgrade_candidates(
        &uid,
        local,
        ctx.force,
        exact_version.then_some(version.as_str()),
        ctx.shlibs,
        ctx.reinstall_on_options_change,
    );

    if !candidates.is_empty() {
        ctx.add_request
            .add_from_universe(&*ctx.universe, &uid, false, false);
        Ok(CandidateOutcome::Added)
    } else if local.is_some() {
        Ok(CandidateOutcome::AlreadyInstalled)
    } else {
        Ok(CandidateOutcome::NotFound)
    }
}

/// Find upgrade or install candidates for one pattern.
///
/// Queries the repositories, registers every qualifying candidate, and on a
/// miss falls back to keeping a still-depended-on local package or guessing
/// a renamed candidate.
pub fn find_upgrade(
    ctx: &mut UpgradeCtx<'_>,
    pattern: &str,
    mode: MatchMode,
) -> Result<CandidateOutcome> {
    let remotes = ctx
        .db
        .query_remote(pattern, mode, ctx.reponame, LoadFlags::CANDIDATE)?;

    // Broad matches may pick up packages that were never installed; an
    // upgrade must not install those. Exact matches are vetted by the
    // caller so a missing local package can be reported.
    let checklocal =
        ctx.is_upgrade && !matches!(mode, MatchMode::Exact | MatchMode::All) && !ctx.is_fetch;

    let mut found = false;
    let mut installed = false;
    for remote in remotes {
        if checklocal && ctx.db.get_local(&remote.uid, LoadFlags::BASIC)?.is_none() {
            continue;
        }
        let exact_version = remote.name != pattern && !pattern.starts_with('@');
        match process_remote_pkg(ctx, remote, exact_version)? {
            CandidateOutcome::Added => found = true,
            CandidateOutcome::AlreadyInstalled => installed = true,
            _ => {}
        }
    }

    if found {
        return Ok(CandidateOutcome::Added);
    }
    if installed {
        return Ok(CandidateOutcome::AlreadyInstalled);
    }

    // Nothing matched remotely. A local package that other installed
    // packages still depend on is kept as-is; otherwise try to guess a
    // renamed successor.
    let Some(local) = ctx
        .universe
        .get_local(ctx.db, pattern, LoadFlags::BASIC | LoadFlags::RDEPS)?
    else {
        return Ok(CandidateOutcome::NotFound);
    };
    let rdep_uids: Vec<String> = ctx
        .universe
        .get(local)
        .rdeps
        .iter()
        .map(|d| d.uid.clone())
        .collect();
    for rdep_uid in rdep_uids {
        if ctx
            .universe
            .get_local(ctx.db, &rdep_uid, LoadFlags::BASIC)?
            .is_some()
        {
            return Ok(CandidateOutcome::KeptLocal);
        }
    }

    debug!(
        "non-automatic package with pattern {} has not been found in remote repo",
        pattern
    );
    guess_upgrade_candidate(ctx, pattern)
}

/// Strip a trailing version-ish run of digits and dots from a name
fn strip_version_suffix(name: &str) -> &str {
    let bytes = name.as_bytes();
    let mut len = bytes.len();
    while len > 0 && (bytes[len - 1].is_ascii_digit() || bytes[len - 1] == b'.') {
        len -= 1;
    }
    &name[..len]
}

fn try_remote_candidate(
    ctx: &mut UpgradeCtx<'_>,
    pattern: &str,
    mode: MatchMode,
) -> Result<CandidateOutcome> {
    let remotes = ctx
        .db
        .query_remote(pattern, mode, ctx.reponame, LoadFlags::CANDIDATE)?;
    let mut found = false;
    for remote in remotes {
        if process_remote_pkg(ctx, remote, false)? == CandidateOutcome::Added {
            found = true;
        }
    }
    Ok(if found {
        CandidateOutcome::Added
    } else {
        CandidateOutcome::NotFound
    })
}

/// Guess a successor for a package name that disappeared from the
/// repositories: try the origin tail, then the name with its trailing
/// version digits stripped, exact first and `^name[0-9.]*$` second.
pub fn guess_upgrade_candidate(
    ctx: &mut UpgradeCtx<'_>,
    pattern: &str,
) -> Result<CandidateOutcome> {
    let name = match pattern.split_once('/') {
        Some((_, tail)) if !tail.is_empty() => {
            if try_remote_candidate(ctx, tail, MatchMode::Internal)? == CandidateOutcome::Added {
                return Ok(CandidateOutcome::Added);
            }
            tail
        }
        _ => pattern,
    };

    let stripped = strip_version_suffix(name);
    if stripped.len() == name.len() || stripped.is_empty() {
        return Ok(CandidateOutcome::NotFound);
    }

    if try_remote_candidate(ctx, stripped, MatchMode::Internal)? == CandidateOutcome::Added {
        return Ok(CandidateOutcome::Added);
    }
    let re = format!("^{}[0-9.]*$", regex::escape(stripped));
    try_remote_candidate(ctx, &re, MatchMode::Regex)
}

/// Probe for a newer version of the package manager itself.
///
/// Runs with force and recursion disabled; a strictly newer remote
/// candidate means the whole transaction should shrink to upgrading the
/// manager alone.
pub fn new_pkg_version(ctx: &mut UpgradeCtx<'_>, self_uid: &str) -> Result<bool> {
    let Some(local) = ctx
        .universe
        .get_local(ctx.db, self_uid, LoadFlags::BASIC)?
    else {
        // Not installed as a package, nothing to probe
        return Ok(false);
    };
    let local_version = ctx.universe.get(local).version.clone();

    let forced = std::mem::replace(&mut ctx.force, false);
    let rc = find_upgrade(ctx, self_uid, MatchMode::Internal);
    ctx.force = forced;
    rc?;

    if let Some(chain) = ctx.universe.find(self_uid) {
        for &id in chain {
            let pkg = ctx.universe.get(id);
            if !pkg.is_installed()
                && version_cmp(&local_version, &pkg.version) == Ordering::Less
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Job types whose explicit requests clear the automatic flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomaticPolicy {
    Install,
    Other,
}

/// Propagate automatic flags across the universe.
///
/// Singleton chains inherit from the request that named them (absent or
/// automatic requests mean dependency-pulled); multi-member chains inherit
/// the installed member's flag, or turn automatic wholesale when no local
/// member exists and nothing asked for them explicitly.
pub fn propagate_automatic(
    universe: &mut Universe,
    add_request: &Request,
    policy: AutomaticPolicy,
) {
    let uids: Vec<String> = universe.uids().cloned().collect();
    for uid in uids {
        let chain: Vec<PkgId> = universe.find(&uid).unwrap_or(&[]).to_vec();
        if chain.len() == 1 {
            let id = chain[0];
            let requested = add_request.get(&uid);
            let automatic_req = requested.map(|r| r.automatic).unwrap_or(true);
            let pkg = universe.get_mut(id);
            if automatic_req && !pkg.is_installed() {
                debug!("set automatic flag for {}", uid);
                pkg.automatic = true;
            } else if policy == AutomaticPolicy::Install {
                pkg.automatic = false;
            }
            continue;
        }

        let local_flag = chain
            .iter()
            .find(|&&id| universe.get(id).is_installed())
            .map(|&id| universe.get(id).automatic);
        match local_flag {
            Some(automatic) => {
                for &id in &chain {
                    let pkg = universe.get_mut(id);
                    if !pkg.is_installed() {
                        pkg.automatic = automatic;
                    }
                }
            }
            None => {
                let automatic_req = add_request.get(&uid).map(|r| r.automatic).unwrap_or(true);
                if automatic_req {
                    debug!("set automatic flag for {}", uid);
                    for &id in &chain {
                        universe.get_mut(id).automatic = true;
                    }
                }
            }
        }
    }
}

/// Stamp a reason on each cascaded delete naming the requested package it
/// was removed for. The search walks dependency edges from the deleted
/// package toward the delete request, cycle-guarded by a visited set.
pub fn set_deinstall_reasons(
    universe: &mut Universe,
    delete_request: &Request,
    deleted: &[PkgId],
) {
    for &id in deleted {
        let uid = universe.get(id).uid.clone();
        let Some(root_uid) = find_deinstall_request(universe, delete_request, &uid) else {
            continue;
        };
        if root_uid == uid {
            continue;
        }
        let root = universe
            .find(&root_uid)
            .and_then(|chain| chain.first().copied());
        if let Some(root) = root {
            let reason = format!("depends on {}", universe.get(root));
            universe.get_mut(id).reason = Some(reason);
        }
    }
}

fn find_deinstall_request(
    universe: &Universe,
    delete_request: &Request,
    start_uid: &str,
) -> Option<String> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut worklist = vec![start_uid.to_string()];
    while let Some(uid) = worklist.pop() {
        if !visited.insert(uid.clone()) {
            continue;
        }
        // Cascaded packages sit in the request too; only the explicitly
        // requested ones qualify as the reason
        if let Some(entry) = delete_request.get(&uid) {
            if !entry.automatic {
                return Some(uid);
            }
        }
        if let Some(chain) = universe.find(&uid) {
            for &id in chain {
                for dep in &universe.get(id).deps {
                    worklist.push(dep.uid.clone());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Dep, PkgType};

    fn pair() -> (Package, Package) {
        let mut local = Package::new("curl", "8.6.0", PkgType::Installed);
        local.digest = Some("aaa".into());
        let mut remote = Package::new("curl", "8.6.0", PkgType::Remote);
        remote.digest = Some("bbb".into());
        (local, remote)
    }

    #[test]
    fn test_same_digest_never_upgrades() {
        let shlibs = SystemShlibs::default();
        let (mut local, mut remote) = pair();
        remote.digest = local.digest.clone();
        // Differing fields must not matter once digests match
        remote.version = "99.0".into();
        local.abi = "x".into();
        assert!(!needs_upgrade(&shlibs, &mut remote, &local, true));
    }

    #[test]
    fn test_locked_local_never_upgrades() {
        let shlibs = SystemShlibs::default();
        let (mut local, mut remote) = pair();
        local.locked = true;
        remote.version = "9.0".into();
        assert!(!needs_upgrade(&shlibs, &mut remote, &local, false));
    }

    #[test]
    fn test_version_decides_first() {
        let shlibs = SystemShlibs::default();
        let (local, mut remote) = pair();
        remote.version = "8.7.0".into();
        let mut l = local.clone();
        assert!(needs_upgrade(&shlibs, &mut remote, &l, false));
        assert_eq!(remote.reason.as_deref(), Some("new version"));

        let mut older = remote.clone();
        older.version = "8.5.0".into();
        l.version = "8.6.0".into();
        assert!(!needs_upgrade(&shlibs, &mut older, &l, false));
    }

    #[test]
    fn test_abi_change() {
        let shlibs = SystemShlibs::default();
        let (mut local, mut remote) = pair();
        local.abi = "FreeBSD:13:amd64".into();
        remote.abi = "FreeBSD:14:amd64".into();
        assert!(needs_upgrade(&shlibs, &mut remote, &local, false));
        assert_eq!(
            remote.reason.as_deref(),
            Some("ABI changed: 'FreeBSD:13:amd64' -> 'FreeBSD:14:amd64'")
        );
    }

    #[test]
    fn test_options_gated_by_config() {
        let shlibs = SystemShlibs::default();
        let (mut local, mut remote) = pair();
        local.options.push("ssl:on".into());
        remote.options.push("ssl:off".into());
        assert!(!needs_upgrade(&shlibs, &mut remote.clone(), &local, false));
        assert!(needs_upgrade(&shlibs, &mut remote, &local, true));
        assert_eq!(remote.reason.as_deref(), Some("options changed: ssl:on->off"));
    }

    #[test]
    fn test_dependency_set_change() {
        let shlibs = SystemShlibs::default();
        let (local, mut remote) = pair();
        remote.deps.push(Dep {
            name: "zlib".into(),
            origin: "devel/zlib".into(),
            uid: "zlib".into(),
        });
        assert!(needs_upgrade(&shlibs, &mut remote, &local, false));
        assert_eq!(
            remote.reason.as_deref(),
            Some("direct dependencies added: zlib:devel/zlib")
        );
    }

    #[test]
    fn test_system_shlibs_ignored_in_required_diff() {
        let mut shlibs = SystemShlibs::default();
        let (local, mut remote) = pair();
        remote.shlibs_required.push("libc.so.7".into());

        assert!(needs_upgrade(&shlibs, &mut remote.clone(), &local, false));

        shlibs.names.push("libc.so.7".into());
        assert!(!needs_upgrade(&shlibs, &mut remote, &local, false));
    }

    #[test]
    fn test_strip_version_suffix() {
        assert_eq!(strip_version_suffix("postgresql12.3"), "postgresql");
        assert_eq!(strip_version_suffix("curl"), "curl");
        assert_eq!(strip_version_suffix("1.2.3"), "");
    }

    #[test]
    fn test_guess_candidate_finds_renamed_package() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut remote = Package::new("postgresql16", "16.2", PkgType::Remote);
        remote.reponame = Some("primary".into());
        db.insert_package(&remote).unwrap();

        let shlibs = SystemShlibs::default();
        let mut universe = Universe::new();
        let mut add_request = Request::new();
        let mut ctx = UpgradeCtx {
            db: &db,
            universe: &mut universe,
            add_request: &mut add_request,
            shlibs: &shlibs,
            reponame: None,
            force: false,
            is_upgrade: false,
            is_fetch: false,
            reinstall_on_options_change: false,
        };

        let rc = guess_upgrade_candidate(&mut ctx, "postgresql12").unwrap();
        assert_eq!(rc, CandidateOutcome::Added);
        assert!(add_request.contains("postgresql16"));
    }

    #[test]
    fn test_find_upgrade_keeps_depended_on_local() {
        let db = PackageDb::open_in_memory().unwrap();
        // Installed library with an installed consumer, absent remotely
        db.insert_package(&Package::new("libold", "1.0", PkgType::Installed))
            .unwrap();
        let mut app = Package::new("app", "1.0", PkgType::Installed);
        app.deps.push(Dep {
            name: "libold".into(),
            origin: "devel/libold".into(),
            uid: "libold".into(),
        });
        db.insert_package(&app).unwrap();

        let shlibs = SystemShlibs::default();
        let mut universe = Universe::new();
        let mut add_request = Request::new();
        let mut ctx = UpgradeCtx {
            db: &db,
            universe: &mut universe,
            add_request: &mut add_request,
            shlibs: &shlibs,
            reponame: None,
            force: false,
            is_upgrade: true,
            is_fetch: false,
            reinstall_on_options_change: false,
        };

        let rc = find_upgrade(&mut ctx, "libold", MatchMode::Internal).unwrap();
        assert_eq!(rc, CandidateOutcome::KeptLocal);
        assert!(universe.find("libold").is_some());
        assert!(add_request.is_empty());
    }

    #[test]
    fn test_find_upgrade_locked_local_aborts() {
        let db = PackageDb::open_in_memory().unwrap();
        let mut local = Package::new("curl", "8.5.0", PkgType::Installed);
        local.locked = true;
        db.insert_package(&local).unwrap();
        let mut remote = Package::new("curl", "8.6.0", PkgType::Remote);
        remote.reponame = Some("primary".into());
        db.insert_package(&remote).unwrap();

        let shlibs = SystemShlibs::default();
        let mut universe = Universe::new();
        let mut add_request = Request::new();
        let mut ctx = UpgradeCtx {
            db: &db,
            universe: &mut universe,
            add_request: &mut add_request,
            shlibs: &shlibs,
            reponame: None,
            force: false,
            is_upgrade: false,
            is_fetch: false,
            reinstall_on_options_change: false,
        };

        let err = find_upgrade(&mut ctx, "curl", MatchMode::Exact).unwrap_err();
        assert!(matches!(err, crate::error::Error::Locked { .. }));
    }

    #[test]
    fn test_propagate_automatic_singleton() {
        let mut universe = Universe::new();
        let dep = universe
            .add_package(Package::new("zlib", "1.3", PkgType::Remote), false)
            .unwrap()
            .id();
        let asked = universe
            .add_package(Package::new("curl", "8.6.0", PkgType::Remote), false)
            .unwrap()
            .id();

        let mut add_request = Request::new();
        add_request.add_from_universe(&universe, "curl", false, false);

        propagate_automatic(&mut universe, &add_request, AutomaticPolicy::Install);
        assert!(universe.get(dep).automatic);
        assert!(!universe.get(asked).automatic);
    }

    #[test]
    fn test_propagate_automatic_inherits_from_local() {
        let mut universe = Universe::new();
        let mut local = Package::new("libfoo", "1.0", PkgType::Installed);
        local.automatic = true;
        universe.add_package(local, false).unwrap();
        let remote = universe
            .add_package(Package::new("libfoo", "1.1", PkgType::Remote), false)
            .unwrap()
            .id();

        let add_request = Request::new();
        propagate_automatic(&mut universe, &add_request, AutomaticPolicy::Other);
        assert!(universe.get(remote).automatic);
    }

    #[test]
    fn test_deinstall_reason_stamping() {
        let mut universe = Universe::new();
        // plugin depends on app; deleting app cascades to plugin
        let mut plugin = Package::new("plugin", "0.5", PkgType::Installed);
        plugin.deps.push(Dep {
            name: "app".into(),
            origin: "misc/app".into(),
            uid: "app".into(),
        });
        let plugin_id = universe.add_package(plugin, false).unwrap().id();
        let app = Package::new("app", "1.0", PkgType::Installed);
        universe.add_package(app, false).unwrap();

        let mut delete_request = Request::new();
        delete_request.add_from_universe(&universe, "app", true, false);

        set_deinstall_reasons(&mut universe, &delete_request, &[plugin_id]);
        assert_eq!(
            universe.get(plugin_id).reason.as_deref(),
            Some("depends on app-1.0")
        );
    }
}
