// src/jobs/mod.rs

//! Transaction jobs
//!
//! A [`Jobs`] value is one package transaction: patterns go in, `solve`
//! expands them into a universe of package variants, runs the constraint
//! solver, and produces an ordered list of [`SolvedJob`] steps; `apply`
//! walks that list through a caller-supplied [`Executor`]. Each job type
//! (install, upgrade, deinstall, autoremove, fetch) populates the requests
//! differently but shares the solve and ordering machinery.

pub mod cascade;
pub mod conflicts;
pub mod fetch;
pub mod request;
pub mod solver;
pub mod universe;
pub mod upgrade;

use crate::db::PackageDb;
use crate::error::{Error, Result};
use crate::jobs::cascade::{process_delete_request, OrphanClassifier};
use crate::jobs::conflicts::check_conflicts;
use crate::jobs::fetch::{cache_path, fetch_packages, Fetcher};
use crate::jobs::request::Request;
use crate::jobs::solver::{
    encode_problem, parse_solution, run_external, solve_internal, Decision, SolverVerdict,
};
use crate::jobs::universe::{PkgId, Universe};
use crate::jobs::upgrade::{AutomaticPolicy, CandidateOutcome, UpgradeCtx};
use crate::package::{LoadFlags, Package, PkgType};
use crate::pattern::{JobPattern, MatchMode};
use crate::shlibs::{scan_system_shlibs, SystemShlibs};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Conflict discard-and-re-solve attempts before giving up
const MAX_CONFLICT_RETRIES: usize = 5;

/// What a transaction is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Install,
    Upgrade,
    Deinstall,
    Autoremove,
    Fetch,
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::Install => "install",
            JobType::Upgrade => "upgrade",
            JobType::Deinstall => "deinstall",
            JobType::Autoremove => "autoremove",
            JobType::Fetch => "fetch",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavior modifiers for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobFlags(u32);

impl JobFlags {
    pub const NONE: JobFlags = JobFlags(0);
    /// Skip safety checks and predicates; reinstall and delete regardless
    pub const FORCE: JobFlags = JobFlags(1 << 0);
    /// Solve and report, execute nothing
    pub const DRY_RUN: JobFlags = JobFlags(1 << 1);
    /// Executors should not run package scripts
    pub const NO_SCRIPTS: JobFlags = JobFlags(1 << 2);
    /// Reinstall reverse dependencies of everything requested
    pub const RECURSIVE: JobFlags = JobFlags(1 << 3);
    /// Prefer candidates from the repository a package came from
    pub const CONSERVATIVE: JobFlags = JobFlags(1 << 4);
    /// Probe for a newer package manager before a full upgrade
    pub const VERSION_TEST: JobFlags = JobFlags(1 << 5);
    /// Fetch upgrades for everything installed instead of pattern matches
    pub const UPGRADES_FOR_INSTALLED: JobFlags = JobFlags(1 << 6);

    pub fn contains(&self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: JobFlags) -> JobFlags {
        JobFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for JobFlags {
    type Output = JobFlags;

    fn bitor(self, rhs: JobFlags) -> JobFlags {
        self.union(rhs)
    }
}

/// Knobs a transaction reads from configuration
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub cachedir: PathBuf,
    /// Root the system shared-library scan runs under
    pub system_root: PathBuf,
    /// External CUDF solver command, run through the shell
    pub cudf_solver: Option<String>,
    /// External SAT solver command, consulted when no CUDF solver is set
    pub sat_solver: Option<String>,
    pub reinstall_on_options_change: bool,
    pub conservative_upgrade: bool,
    /// uid of the package manager's own package
    pub self_uid: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            cachedir: PathBuf::from("/var/cache/berth"),
            system_root: PathBuf::from("/"),
            cudf_solver: None,
            sat_solver: None,
            reinstall_on_options_change: false,
            conservative_upgrade: false,
            self_uid: "berth".to_string(),
        }
    }
}

/// Kind of one solved transaction step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvedKind {
    Install,
    Upgrade,
    /// Early half of a split upgrade: the old variant goes away first
    UpgradeRemove,
    /// Late half of a split upgrade: the new variant lands afterwards
    UpgradeInstall,
    Delete,
    Fetch,
}

/// One ordered step of a solved transaction
#[derive(Debug, Clone, Copy)]
pub struct SolvedJob {
    pub kind: SolvedKind,
    /// The variant this step acts on (the outgoing one for removals)
    pub new: PkgId,
    /// Replaced installed variant for upgrades
    pub old: Option<PkgId>,
    /// Index of the partner step of a split upgrade
    pub xlink: Option<usize>,
}

/// Applies solved steps to the system; supplied by the caller
pub trait Executor {
    fn install(&mut self, pkg: &Package) -> Result<()>;
    fn upgrade(&mut self, old: &Package, new: &Package) -> Result<()>;
    fn delete(&mut self, pkg: &Package) -> Result<()>;
}

/// Reads the manifest out of a package archive; supplied by the caller
pub trait PackageFileLoader {
    /// Load the manifest of the archive at `path` (`-` reads stdin)
    fn load(&self, path: &Path) -> Result<Package>;
}

/// One package transaction from patterns to ordered steps
pub struct Jobs<'a> {
    db: &'a PackageDb,
    job_type: JobType,
    pub flags: JobFlags,
    pub config: JobsConfig,
    universe: Universe,
    request_add: Request,
    request_delete: Request,
    patterns: Vec<JobPattern>,
    jobs: Vec<SolvedJob>,
    solved: bool,
    conflicts_registered: usize,
    system_shlibs: SystemShlibs,
    shlibs_scanned: bool,
    reponame: Option<String>,
    /// Names of locked or vital packages skipped by a deinstall
    locked_pkgs: Vec<String>,
    /// Some selected archive is not cached yet; execution needs a fetch
    need_fetch: bool,
    file_loader: Option<&'a dyn PackageFileLoader>,
}

impl<'a> Jobs<'a> {
    pub fn new(db: &'a PackageDb, job_type: JobType) -> Self {
        Self {
            db,
            job_type,
            flags: JobFlags::NONE,
            config: JobsConfig::default(),
            universe: Universe::new(),
            request_add: Request::new(),
            request_delete: Request::new(),
            patterns: Vec::new(),
            jobs: Vec::new(),
            solved: false,
            conflicts_registered: 0,
            system_shlibs: SystemShlibs::default(),
            shlibs_scanned: false,
            reponame: None,
            locked_pkgs: Vec::new(),
            need_fetch: false,
            file_loader: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn set_flags(&mut self, flags: JobFlags) {
        self.flags = flags;
    }

    pub fn set_file_loader(&mut self, loader: &'a dyn PackageFileLoader) {
        self.file_loader = Some(loader);
    }

    /// Restrict remote candidates to one repository
    pub fn set_repository(&mut self, reponame: &str) -> Result<()> {
        if !self.db.has_repository(reponame)? {
            return Err(Error::UnknownRepository(reponame.to_string()));
        }
        self.reponame = Some(reponame.to_string());
        Ok(())
    }

    /// Append one pattern; refused once the job is solved
    pub fn add_pattern(&mut self, arg: &str, mode: MatchMode) -> Result<()> {
        if self.solved {
            return Err(Error::AlreadySolved);
        }
        self.patterns.push(JobPattern::from_arg(arg, mode));
        Ok(())
    }

    pub fn patterns(&self) -> &[JobPattern] {
        &self.patterns
    }

    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs(&self) -> &[SolvedJob] {
        &self.jobs
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn need_fetch(&self) -> bool {
        self.need_fetch
    }

    pub fn conflicts_registered(&self) -> usize {
        self.conflicts_registered
    }

    /// The 32-bit compatibility tree was missing during the shlib scan;
    /// 32-bit shared-library requirements are not meaningful here
    pub fn ignore_compat32(&self) -> bool {
        self.system_shlibs.no_compat32
    }

    /// Names of packages a deinstall skipped as locked or vital, sorted
    pub fn locked_packages(&self) -> Vec<String> {
        let mut names = self.locked_pkgs.clone();
        names.sort();
        names.dedup();
        names
    }

    /// Solve the transaction: expand requests, run the solver, order the
    /// resulting steps, and converge the file-conflict loop.
    pub fn solve(&mut self) -> Result<()> {
        if self.solved {
            return Ok(());
        }
        self.ensure_system_shlibs()?;

        match self.job_type {
            JobType::Install | JobType::Upgrade => self.populate_install_upgrade()?,
            JobType::Deinstall => self.populate_deinstall()?,
            JobType::Autoremove => self.populate_autoremove()?,
            JobType::Fetch => self.populate_fetch()?,
        }

        self.constraint_solve()?;

        if matches!(self.job_type, JobType::Deinstall | JobType::Autoremove) {
            let deleted: Vec<PkgId> = self
                .jobs
                .iter()
                .filter(|j| j.kind == SolvedKind::Delete)
                .map(|j| j.new)
                .collect();
            upgrade::set_deinstall_reasons(&mut self.universe, &self.request_delete, &deleted);
        }

        self.solved = true;
        self.refresh_files_and_need_fetch()?;
        if !self.need_fetch && self.job_type != JobType::Fetch {
            self.run_conflict_loop()?;
        }

        debug!("solved {} job with {} steps", self.job_type, self.jobs.len());
        Ok(())
    }

    /// Execute the solved steps.
    ///
    /// Remote archives are downloaded through `fetcher` first; fetch jobs
    /// and dry runs stop there. When `solve` had to defer the conflict
    /// check for lack of catalog file lists, it runs here over the fetched
    /// archives. Vital and self-removal guards run before anything touches
    /// the system.
    pub fn apply(
        &mut self,
        fetcher: Option<&mut dyn Fetcher>,
        executor: &mut dyn Executor,
    ) -> Result<()> {
        if !self.solved {
            return Err(Error::Solver("the job has not been solved".to_string()));
        }
        // Left over from a deferred check of an earlier apply attempt
        if self.conflicts_registered > 0 {
            return Err(Error::ConflictsDetected(self.conflicts_registered));
        }
        self.check_removal_guards()?;
        let dry_run = self.flags.contains(JobFlags::DRY_RUN);

        let to_fetch: Vec<Package> = self
            .jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.kind,
                    SolvedKind::Install
                        | SolvedKind::Upgrade
                        | SolvedKind::UpgradeInstall
                        | SolvedKind::Fetch
                )
            })
            .map(|j| self.universe.get(j.new))
            .filter(|p| p.pkg_type == PkgType::Remote)
            .cloned()
            .collect();
        if !to_fetch.is_empty() {
            match fetcher {
                Some(fetcher) => {
                    fetch_packages(&self.config.cachedir, to_fetch.iter(), fetcher, dry_run)?
                }
                None if self.job_type == JobType::Fetch => {
                    return Err(Error::Solver(
                        "a fetch job needs a fetcher to run".to_string(),
                    ));
                }
                None => {}
            }
        }

        if self.job_type == JobType::Fetch || dry_run {
            return Ok(());
        }

        // The conflict check deferred by solve runs now that the archives
        // carry the missing file lists
        if self.need_fetch {
            self.load_fetched_files()?;
            self.need_fetch = false;
            self.run_conflict_loop()?;
            if self.conflicts_registered > 0 {
                return Err(Error::ConflictsDetected(self.conflicts_registered));
            }
        }

        for job in &self.jobs {
            match job.kind {
                SolvedKind::Delete | SolvedKind::UpgradeRemove => {
                    executor.delete(self.universe.get(job.new))?;
                }
                SolvedKind::Install => {
                    executor.install(self.universe.get(job.new))?;
                }
                SolvedKind::Upgrade | SolvedKind::UpgradeInstall => {
                    let new = self.universe.get(job.new);
                    match job.old {
                        Some(old) => executor.upgrade(self.universe.get(old), new)?,
                        None => executor.install(new)?,
                    }
                }
                SolvedKind::Fetch => {}
            }
        }
        Ok(())
    }

    /// Scan the base system's shared libraries unless the base system is
    /// itself packaged (then its libraries live in the database like any
    /// other package's).
    fn ensure_system_shlibs(&mut self) -> Result<()> {
        if self.shlibs_scanned {
            return Ok(());
        }
        self.shlibs_scanned = true;
        if self.db.file_exists("/usr/bin/uname")? {
            debug!("base system is packaged, skipping shared-library scan");
            return Ok(());
        }
        self.system_shlibs = scan_system_shlibs(&self.config.system_root)?;
        Ok(())
    }

    fn conservative(&self) -> bool {
        self.flags.contains(JobFlags::CONSERVATIVE) || self.config.conservative_upgrade
    }

    fn upgrade_ctx(&mut self, is_upgrade: bool, is_fetch: bool) -> UpgradeCtx<'_> {
        UpgradeCtx {
            db: self.db,
            universe: &mut self.universe,
            add_request: &mut self.request_add,
            shlibs: &self.system_shlibs,
            reponame: self.reponame.as_deref(),
            force: self.flags.contains(JobFlags::FORCE),
            is_upgrade,
            is_fetch,
            reinstall_on_options_change: self.config.reinstall_on_options_change,
        }
    }

    fn populate_install_upgrade(&mut self) -> Result<()> {
        let is_upgrade = self.job_type == JobType::Upgrade;
        if self.job_type == JobType::Install && self.patterns.is_empty() {
            return Err(Error::EmptyRequest);
        }

        let mut shrunk = false;
        if is_upgrade
            && self.flags.contains(JobFlags::VERSION_TEST)
            && !self.flags.contains(JobFlags::DRY_RUN)
        {
            let self_uid = self.config.self_uid.clone();
            let mut ctx = self.upgrade_ctx(true, false);
            if upgrade::new_pkg_version(&mut ctx, &self_uid)? {
                info!(
                    "a newer {} is available, shrinking the job to upgrading it",
                    self_uid
                );
                shrunk = true;
            }
        }

        if !shrunk {
            if self.patterns.is_empty() {
                // Full upgrade: every installed package is a candidate
                for pkg in self.db.all_local(LoadFlags::BASIC)? {
                    if pkg.locked {
                        warn!("{} is locked and may not be upgraded", pkg);
                        continue;
                    }
                    let mut ctx = self.upgrade_ctx(true, false);
                    upgrade::find_upgrade(&mut ctx, &pkg.uid, MatchMode::Internal)?;
                }
            } else {
                self.populate_from_patterns(is_upgrade)?;
            }

            if self.flags.contains(JobFlags::RECURSIVE) {
                self.pull_reverse_dependencies()?;
            }
        }

        self.process_add_request()?;
        let policy = if self.job_type == JobType::Install {
            AutomaticPolicy::Install
        } else {
            AutomaticPolicy::Other
        };
        upgrade::propagate_automatic(&mut self.universe, &self.request_add, policy);
        Ok(())
    }

    fn populate_from_patterns(&mut self, is_upgrade: bool) -> Result<()> {
        let patterns = self.patterns.clone();
        let mut missed: Vec<String> = Vec::new();
        for (idx, jp) in patterns.iter().enumerate() {
            if jp.is_file() {
                self.add_file_request(idx, jp)?;
                continue;
            }
            if is_upgrade
                && matches!(jp.match_mode, MatchMode::Exact | MatchMode::Internal)
                && self
                    .db
                    .query_local(&jp.pattern, jp.match_mode, LoadFlags::BASIC)?
                    .is_empty()
            {
                return Err(Error::NotInstalled(jp.pattern.clone()));
            }

            let mut ctx = self.upgrade_ctx(is_upgrade, false);
            if upgrade::find_upgrade(&mut ctx, &jp.pattern, jp.match_mode)?
                == CandidateOutcome::NotFound
            {
                missed.push(jp.pattern.clone());
            }
        }
        if let Some(first) = missed.into_iter().next() {
            return Err(Error::NoCandidate(first));
        }
        Ok(())
    }

    fn add_file_request(&mut self, idx: usize, jp: &JobPattern) -> Result<()> {
        let Some(loader) = self.file_loader else {
            return Err(Error::InvalidPackageFile(jp.pattern.clone()));
        };
        let Some(path) = jp.file_path.as_deref() else {
            return Err(Error::InvalidPackageFile(jp.pattern.clone()));
        };
        let mut pkg = loader.load(path)?;
        pkg.pkg_type = PkgType::File;
        pkg.sort_lists();
        if self.job_type == JobType::Upgrade
            && self.db.get_local(&pkg.uid, LoadFlags::BASIC)?.is_none()
        {
            return Err(Error::NotInstalled(pkg.uid));
        }

        let uid = pkg.uid.clone();
        let force = self.flags.contains(JobFlags::FORCE);
        if let Some(id) = self.request_add.add(&mut self.universe, pkg, false, force)? {
            if let Some(entry) = self.request_add.get_mut(&uid) {
                if let Some(item) = entry.items.iter_mut().find(|it| it.pkg == id) {
                    item.from_file = Some(idx);
                }
            }
        }
        Ok(())
    }

    /// Force-reinstall the installed reverse dependencies of everything
    /// already requested.
    fn pull_reverse_dependencies(&mut self) -> Result<()> {
        let uids: Vec<String> = self.request_add.uids().cloned().collect();
        for uid in uids {
            for rdep in self.db.rdeps_of(&uid, LoadFlags::BASIC)? {
                if rdep.locked {
                    continue;
                }
                let mut ctx = self.upgrade_ctx(true, false);
                ctx.force = true;
                upgrade::find_upgrade(&mut ctx, &rdep.uid, MatchMode::Internal)?;
            }
        }
        Ok(())
    }

    /// Fan the universe out from every requested item
    fn process_add_request(&mut self) -> Result<()> {
        let start_ids: Vec<PkgId> = self
            .request_add
            .entries()
            .flat_map(|(_, e)| e.items.iter().map(|it| it.pkg))
            .collect();
        for id in start_ids {
            self.universe.process(self.db, id, &mut self.request_add)?;
        }
        Ok(())
    }

    fn populate_deinstall(&mut self) -> Result<()> {
        let force = self.flags.contains(JobFlags::FORCE);
        let patterns = self.patterns.clone();
        for jp in &patterns {
            let matched = self
                .db
                .query_local(&jp.pattern, jp.match_mode, LoadFlags::DELETE)?;
            if matched.is_empty() {
                info!("no installed packages matched '{}'", jp.pattern);
            }
            for pkg in matched {
                if pkg.locked {
                    warn!("{} is locked and cannot be deinstalled", pkg);
                    self.locked_pkgs.push(pkg.name.clone());
                    continue;
                }
                if pkg.vital && !force {
                    warn!("{} is vital and cannot be deinstalled", pkg);
                    self.locked_pkgs.push(pkg.name.clone());
                    continue;
                }
                self.request_delete
                    .add(&mut self.universe, pkg, false, false)?;
            }
        }

        process_delete_request(
            self.db,
            &mut self.universe,
            &mut self.request_delete,
            &self.system_shlibs,
            force,
        )
    }

    fn populate_autoremove(&mut self) -> Result<()> {
        let mut classifier = OrphanClassifier::new();
        for pkg in self.db.all_local(LoadFlags::DELETE)? {
            if !pkg.automatic || pkg.vital || pkg.locked {
                continue;
            }
            if classifier.is_orphaned(self.db, &mut self.universe, &pkg.uid)? {
                debug!("autoremove selects {}", pkg);
                self.request_delete
                    .add(&mut self.universe, pkg, true, false)?;
            }
        }

        process_delete_request(
            self.db,
            &mut self.universe,
            &mut self.request_delete,
            &self.system_shlibs,
            self.flags.contains(JobFlags::FORCE),
        )
    }

    fn populate_fetch(&mut self) -> Result<()> {
        if self.flags.contains(JobFlags::UPGRADES_FOR_INSTALLED) {
            for pkg in self.db.all_local(LoadFlags::BASIC)? {
                if pkg.locked {
                    continue;
                }
                let mut ctx = self.upgrade_ctx(true, true);
                upgrade::find_upgrade(&mut ctx, &pkg.uid, MatchMode::Internal)?;
            }
        } else {
            let patterns = self.patterns.clone();
            for jp in &patterns {
                let mut ctx = self.upgrade_ctx(false, true);
                if upgrade::find_upgrade(&mut ctx, &jp.pattern, jp.match_mode)?
                    == CandidateOutcome::NotFound
                {
                    warn!("no packages matching '{}' to fetch", jp.pattern);
                }
            }
        }
        self.process_add_request()
    }

    /// Narrow the chains, run the solver (retrying one transient verdict),
    /// and map its decisions onto ordered steps.
    fn constraint_solve(&mut self) -> Result<()> {
        self.universe.process_upgrade_chains(self.conservative());

        let external = self
            .config
            .cudf_solver
            .clone()
            .or_else(|| self.config.sat_solver.clone());
        let mut retried = false;
        let decisions = loop {
            let verdict = match &external {
                Some(cmd) => {
                    let problem =
                        encode_problem(&self.universe, &self.request_add, &self.request_delete);
                    let out = run_external(cmd, &problem)?;
                    parse_solution(&out)?
                }
                None => solve_internal(&self.universe, &self.request_add, &self.request_delete)?,
            };
            match verdict {
                SolverVerdict::Selection(decisions) => break decisions,
                SolverVerdict::TryAgain if !retried => {
                    debug!("solver asked for another attempt");
                    retried = true;
                }
                SolverVerdict::TryAgain => {
                    return Err(Error::Solver(
                        "solver did not converge after a retry".to_string(),
                    ));
                }
            }
        };
        self.map_decisions(decisions)
    }

    /// The chain member a solver decision refers to
    fn candidate_for(&self, uid: &str, version: &str) -> Result<PkgId> {
        let chain = self.universe.find(uid).unwrap_or(&[]);
        if let Some(id) = chain.iter().copied().find(|&id| {
            let p = self.universe.get(id);
            !p.is_installed() && p.version == version
        }) {
            return Ok(id);
        }
        chain
            .iter()
            .copied()
            .find(|&id| !self.universe.get(id).is_installed())
            .ok_or_else(|| {
                Error::Solver(format!("solver selected {uid} {version} which has no candidate"))
            })
    }

    /// Turn solver decisions into ordered steps: removals dependents-first,
    /// then installs dependencies-first, with an install folding the removal
    /// of the same uid into an upgrade step. Upgrades stuck on a dependency
    /// cycle split into a remove and an install half.
    fn map_decisions(&mut self, decisions: Vec<Decision>) -> Result<()> {
        self.jobs.clear();

        if self.job_type == JobType::Fetch {
            let mut installs: Vec<(String, PkgId)> = Vec::new();
            for d in decisions.iter().filter(|d| d.install) {
                installs.push((d.uid.clone(), self.candidate_for(&d.uid, &d.version)?));
            }
            installs.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, id) in installs {
                self.jobs.push(SolvedJob {
                    kind: SolvedKind::Fetch,
                    new: id,
                    old: None,
                    xlink: None,
                });
            }
            return Ok(());
        }

        let install_uids: HashSet<&str> = decisions
            .iter()
            .filter(|d| d.install)
            .map(|d| d.uid.as_str())
            .collect();

        let mut removals: Vec<(String, PkgId)> = Vec::new();
        for d in decisions.iter().filter(|d| !d.install) {
            if install_uids.contains(d.uid.as_str()) {
                continue;
            }
            if let Some(id) = self.universe.installed_member(&d.uid) {
                removals.push((d.uid.clone(), id));
            }
        }
        let (ordered, leftover) = topo_dependencies_first(&self.universe, &removals);
        let mut delete_order: Vec<(String, PkgId)> = ordered.into_iter().rev().collect();
        delete_order.extend(leftover);
        for (_, id) in delete_order {
            self.jobs.push(SolvedJob {
                kind: SolvedKind::Delete,
                new: id,
                old: None,
                xlink: None,
            });
        }

        let mut installs: Vec<(String, PkgId)> = Vec::new();
        for d in decisions.iter().filter(|d| d.install) {
            installs.push((d.uid.clone(), self.candidate_for(&d.uid, &d.version)?));
        }
        let (ordered, leftover) = topo_dependencies_first(&self.universe, &installs);
        for (uid, id) in ordered {
            let old = self.universe.installed_member(&uid).filter(|&o| o != id);
            let kind = if old.is_some() {
                SolvedKind::Upgrade
            } else {
                SolvedKind::Install
            };
            self.jobs.push(SolvedJob {
                kind,
                new: id,
                old,
                xlink: None,
            });
        }

        let mut splits: Vec<(PkgId, PkgId)> = Vec::new();
        for (uid, id) in leftover {
            match self.universe.installed_member(&uid).filter(|&o| o != id) {
                Some(old) => splits.push((old, id)),
                None => self.jobs.push(SolvedJob {
                    kind: SolvedKind::Install,
                    new: id,
                    old: None,
                    xlink: None,
                }),
            }
        }
        let base = self.jobs.len();
        let n = splits.len();
        for (i, &(old, _)) in splits.iter().enumerate() {
            self.jobs.push(SolvedJob {
                kind: SolvedKind::UpgradeRemove,
                new: old,
                old: None,
                xlink: Some(base + n + i),
            });
        }
        for (i, &(old, new)) in splits.iter().enumerate() {
            self.jobs.push(SolvedJob {
                kind: SolvedKind::UpgradeInstall,
                new,
                old: Some(old),
                xlink: Some(base + i),
            });
        }
        Ok(())
    }

    /// Load catalog file lists for the selected candidates; whatever still
    /// has none must come out of the fetched archive later.
    fn refresh_files_and_need_fetch(&mut self) -> Result<()> {
        self.need_fetch = false;
        let ids: Vec<PkgId> = self
            .jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.kind,
                    SolvedKind::Install
                        | SolvedKind::Upgrade
                        | SolvedKind::UpgradeInstall
                        | SolvedKind::Fetch
                )
            })
            .map(|j| j.new)
            .collect();
        for id in ids {
            let (uid, version, remote, empty) = {
                let p = self.universe.get(id);
                (
                    p.uid.clone(),
                    p.version.clone(),
                    p.pkg_type == PkgType::Remote,
                    p.files.is_empty(),
                )
            };
            if !remote || !empty {
                continue;
            }
            let files = self.db.remote_files(&uid, &version)?;
            if files.is_empty() {
                self.need_fetch = true;
            } else {
                self.universe.get_mut(id).files = files;
            }
        }
        Ok(())
    }

    /// Fill in still-missing file lists from the fetched archives in the
    /// cache. Without a manifest loader, or for archives not in the cache,
    /// the lists stay empty.
    fn load_fetched_files(&mut self) -> Result<()> {
        let Some(loader) = self.file_loader else {
            warn!("no package file loader, fetched archives cannot be conflict-checked");
            return Ok(());
        };
        let ids: Vec<PkgId> = self
            .jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.kind,
                    SolvedKind::Install | SolvedKind::Upgrade | SolvedKind::UpgradeInstall
                )
            })
            .map(|j| j.new)
            .collect();
        for id in ids {
            let path = {
                let p = self.universe.get(id);
                if p.pkg_type != PkgType::Remote || !p.files.is_empty() {
                    continue;
                }
                cache_path(&self.config.cachedir, p)
            };
            if !path.exists() {
                continue;
            }
            let manifest = loader.load(&path)?;
            let mut files = manifest.files;
            files.sort();
            self.universe.get_mut(id).files = files;
        }
        Ok(())
    }

    /// Discard the second package of every registered file conflict and
    /// re-solve, until a pass registers none.
    fn run_conflict_loop(&mut self) -> Result<()> {
        let mut attempts = 0;
        loop {
            let incoming: Vec<PkgId> = self
                .jobs
                .iter()
                .filter(|j| {
                    matches!(
                        j.kind,
                        SolvedKind::Install | SolvedKind::Upgrade | SolvedKind::UpgradeInstall
                    )
                })
                .map(|j| j.new)
                .collect();
            if incoming.is_empty() {
                self.conflicts_registered = 0;
                return Ok(());
            }

            let mut going_away: HashSet<String> = HashSet::new();
            for job in &self.jobs {
                match job.kind {
                    SolvedKind::Delete | SolvedKind::UpgradeRemove => {
                        going_away.insert(self.universe.get(job.new).uid.clone());
                    }
                    SolvedKind::Upgrade | SolvedKind::UpgradeInstall => {
                        if let Some(old) = job.old {
                            going_away.insert(self.universe.get(old).uid.clone());
                        }
                    }
                    _ => {}
                }
            }

            let found = check_conflicts(self.db, &self.universe, &incoming, &going_away)?;
            self.conflicts_registered = found.len();
            if found.is_empty() {
                return Ok(());
            }
            attempts += 1;
            if attempts > MAX_CONFLICT_RETRIES {
                return Err(Error::ConflictLoopDiverged(attempts));
            }
            warn!(
                "{} file conflicts registered, discarding and re-solving",
                found.len()
            );

            let mut dropped: HashSet<String> = HashSet::new();
            for conflict in &found {
                info!("{}", conflict);
                if dropped.insert(conflict.second.clone()) {
                    self.request_add.remove(&conflict.second);
                    self.universe.drop_candidates(&conflict.second);
                }
            }
            self.constraint_solve()?;
            self.refresh_files_and_need_fetch()?;
            if self.need_fetch {
                return Ok(());
            }
        }
    }

    /// Vital packages and the package manager itself may only be deleted
    /// with force (or, for the manager, an explicit match-all request).
    fn check_removal_guards(&self) -> Result<()> {
        if self.flags.contains(JobFlags::FORCE) {
            return Ok(());
        }
        let match_all = self
            .patterns
            .iter()
            .any(|p| p.match_mode == MatchMode::All);
        for job in &self.jobs {
            if job.kind != SolvedKind::Delete {
                continue;
            }
            let pkg = self.universe.get(job.new);
            if pkg.vital {
                return Err(Error::VitalPackage(pkg.name.clone()));
            }
            if pkg.uid == self.config.self_uid && !match_all {
                return Err(Error::SelfRemoval(pkg.name.clone()));
            }
        }
        Ok(())
    }
}

/// Order `items` so every package comes after the packages it depends on.
///
/// Returns the ordered prefix and the leftover members of dependency
/// cycles, both deterministic for a given input.
fn topo_dependencies_first(
    universe: &Universe,
    items: &[(String, PkgId)],
) -> (Vec<(String, PkgId)>, Vec<(String, PkgId)>) {
    let ids: HashMap<String, PkgId> = items.iter().cloned().collect();
    let mut pending: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependers: HashMap<String, Vec<String>> = HashMap::new();

    for (uid, id) in items {
        let deps: BTreeSet<String> = universe
            .get(*id)
            .deps
            .iter()
            .filter(|d| d.uid != *uid && ids.contains_key(&d.uid))
            .map(|d| d.uid.clone())
            .collect();
        pending.insert(uid.clone(), deps.len());
        for dep in deps {
            dependers.entry(dep).or_default().push(uid.clone());
        }
    }

    let mut ready: BTreeSet<String> = pending
        .iter()
        .filter(|(_, &n)| n == 0)
        .map(|(uid, _)| uid.clone())
        .collect();
    let mut ordered = Vec::new();
    while let Some(uid) = ready.iter().next().cloned() {
        ready.remove(&uid);
        pending.remove(&uid);
        if let Some(&id) = ids.get(&uid) {
            ordered.push((uid.clone(), id));
        }
        if let Some(ds) = dependers.get(&uid) {
            for depender in ds.clone() {
                if let Some(n) = pending.get_mut(&depender) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(depender);
                    }
                }
            }
        }
    }

    let leftover: Vec<(String, PkgId)> = pending
        .keys()
        .filter_map(|uid| ids.get(uid).map(|&id| (uid.clone(), id)))
        .collect();
    (ordered, leftover)
}
