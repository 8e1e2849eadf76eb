// src/jobs/cascade.rs

//! Delete cascade and orphan classification
//!
//! The cascade expands a delete request to a fixed point: reverse
//! dependencies of everything slated for removal join the request, and so
//! does every consumer of a provide or shared-library symbol that loses its
//! last provider. The orphan classifier answers the autoremove question:
//! has an automatically installed package become unreferenced?

use crate::db::PackageDb;
use crate::error::{Error, Result};
use crate::jobs::request::Request;
use crate::jobs::universe::Universe;
use crate::package::{LoadFlags, Package};
use crate::shlibs::SystemShlibs;
use std::collections::HashSet;
use tracing::debug;

/// Attribute groups the cascade needs on every package it inspects
const CASCADE_FLAGS: LoadFlags = LoadFlags::DELETE;

/// Expand the delete request until no pass adds a new package.
///
/// A locked package reached by the cascade aborts it with
/// [`Error::Locked`], naming the blocking package and the package whose
/// removal required it. `force` short-circuits the whole cascade. Growth
/// is bounded by the installed-package count; exceeding it means the
/// request stopped being monotone and is reported as
/// [`Error::CascadeDidNotConverge`].
pub fn process_delete_request(
    db: &PackageDb,
    universe: &mut Universe,
    delete_request: &mut Request,
    system_shlibs: &SystemShlibs,
    force: bool,
) -> Result<()> {
    if force {
        return Ok(());
    }

    let max_passes = db.count_local()? + 1;
    let mut passes = 0;

    loop {
        let pending = delete_request.unprocessed_uids();
        if pending.is_empty() {
            return Ok(());
        }
        passes += 1;
        if passes > max_passes {
            return Err(Error::CascadeDidNotConverge(passes));
        }

        let mut to_process: Vec<Package> = Vec::new();
        for uid in pending {
            delete_request.mark_processed(&uid);
            let Some(lid) = universe.get_local(db, &uid, CASCADE_FLAGS)? else {
                continue;
            };
            let lp = universe.get(lid).clone();

            for rdep in &lp.rdeps {
                append_to_del_request(db, universe, &rdep.uid, &lp.name, &mut to_process)?;
            }

            for symbol in lp.provides.iter().chain(lp.shlibs_provided.iter()) {
                process_lost_symbol(
                    db,
                    universe,
                    delete_request,
                    system_shlibs,
                    &lp,
                    symbol,
                    &mut to_process,
                )?;
            }
        }

        for pkg in to_process {
            debug!("delete cascade pulls in {}", pkg);
            delete_request.add(universe, pkg, true, false)?;
        }
    }
}

fn append_to_del_request(
    db: &PackageDb,
    universe: &mut Universe,
    uid: &str,
    reqname: &str,
    to_process: &mut Vec<Package>,
) -> Result<()> {
    let Some(lid) = universe.get_local(db, uid, CASCADE_FLAGS)? else {
        return Ok(());
    };
    let lp = universe.get(lid);
    if lp.locked {
        return Err(Error::Locked {
            package: lp.name.clone(),
            needed_by: reqname.to_string(),
        });
    }
    if !to_process.iter().any(|p| p.uid == lp.uid) {
        to_process.push(lp.clone());
    }
    Ok(())
}

/// Handle one provide/shlib symbol of a package slated for removal.
///
/// Consumers join the cascade only when the symbol has no surviving
/// provider: base-system libraries always survive, and so does a symbol
/// still supplied by a package whose own removal has not been decided yet
/// (it will re-run the check when its turn comes).
fn process_lost_symbol(
    db: &PackageDb,
    universe: &mut Universe,
    delete_request: &Request,
    system_shlibs: &SystemShlibs,
    lp: &Package,
    symbol: &str,
    to_process: &mut Vec<Package>,
) -> Result<()> {
    if system_shlibs.contains(symbol) {
        return Ok(());
    }

    for provider in db.local_providing(symbol, LoadFlags::BASIC)? {
        if provider.uid == lp.uid {
            continue;
        }
        let surviving = match delete_request.get(&provider.uid) {
            Some(entry) => !entry.processed,
            None => true,
        };
        if surviving {
            return Ok(());
        }
    }

    for consumer in db.local_requiring(symbol, LoadFlags::BASIC)? {
        append_to_del_request(db, universe, &consumer.uid, &lp.name, to_process)?;
    }
    Ok(())
}

/// Memoized orphan classification for one job
#[derive(Debug, Default)]
pub struct OrphanClassifier {
    orphaned: HashSet<String>,
    not_orphaned: HashSet<String>,
    /// Cycle guard: uids whose classification is currently on the stack.
    /// A cycle of automatic packages is orphaned collectively, so an
    /// in-progress uid does not veto its dependents.
    visiting: HashSet<String>,
}

impl OrphanClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the package is automatic, not vital, and referenced only by
    /// packages that are themselves orphaned.
    pub fn is_orphaned(
        &mut self,
        db: &PackageDb,
        universe: &mut Universe,
        uid: &str,
    ) -> Result<bool> {
        if self.orphaned.contains(uid) || self.visiting.contains(uid) {
            return Ok(true);
        }
        if self.not_orphaned.contains(uid) {
            return Ok(false);
        }

        self.visiting.insert(uid.to_string());
        let verdict = self.classify(db, universe, uid);
        self.visiting.remove(uid);

        let verdict = verdict?;
        if verdict {
            self.orphaned.insert(uid.to_string());
        } else {
            self.not_orphaned.insert(uid.to_string());
        }
        Ok(verdict)
    }

    fn classify(
        &mut self,
        db: &PackageDb,
        universe: &mut Universe,
        uid: &str,
    ) -> Result<bool> {
        let Some(lid) = universe.get_local(db, uid, CASCADE_FLAGS)? else {
            return Ok(false);
        };
        let pkg = universe.get(lid).clone();
        if !pkg.automatic || pkg.vital {
            return Ok(false);
        }

        for rdep in &pkg.rdeps {
            if !self.is_orphaned(db, universe, &rdep.uid)? {
                return Ok(false);
            }
        }

        for symbol in pkg.provides.iter().chain(pkg.shlibs_provided.iter()) {
            for consumer in db.local_requiring(symbol, LoadFlags::BASIC)? {
                if consumer.uid == pkg.uid {
                    continue;
                }
                if !self.is_orphaned(db, universe, &consumer.uid)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
