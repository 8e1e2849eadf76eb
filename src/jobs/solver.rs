// src/jobs/solver.rs

//! Constraint-solve translation
//!
//! The universe and requests are encoded into a textual problem of
//! must-install, must-remove, dependency, and conflict clauses. The
//! built-in solver handles the common case deterministically; an external
//! solver command can be swapped in, fed the problem on stdin and read
//! back on stdout. A `try-again` verdict from the solver is retried once
//! by the orchestrator.

use crate::error::{Error, Result};
use crate::jobs::request::Request;
use crate::jobs::universe::{PkgId, Universe};
use crate::version::version_cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use tracing::debug;

/// One solver decision over a uid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub uid: String,
    pub version: String,
    pub install: bool,
}

/// Outcome of one solver invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverVerdict {
    Selection(Vec<Decision>),
    /// Transient condition; the orchestrator re-solves once
    TryAgain,
}

/// Encode universe and requests as the textual solver problem.
///
/// Lines are emitted in sorted uid order so the encoding is stable for a
/// given universe.
pub fn encode_problem(universe: &Universe, add: &Request, del: &Request) -> String {
    let mut out = String::from("problem\n");

    let mut uids: Vec<&String> = universe.uids().collect();
    uids.sort();
    for uid in &uids {
        for &id in universe.find(uid).unwrap_or(&[]) {
            let pkg = universe.get(id);
            let _ = writeln!(
                out,
                "package {} {} {}",
                pkg.uid,
                pkg.version,
                pkg.pkg_type.as_str()
            );
            for dep in &pkg.deps {
                let _ = writeln!(out, "depend {} {}", pkg.uid, dep.uid);
            }
            for conflict in &pkg.conflicts {
                let _ = writeln!(out, "conflict {} {}", pkg.uid, conflict);
            }
        }
    }

    let mut add_uids: Vec<&String> = add.uids().collect();
    add_uids.sort();
    for uid in add_uids {
        let _ = writeln!(out, "request install {uid}");
    }
    let mut del_uids: Vec<&String> = del.uids().collect();
    del_uids.sort();
    for uid in del_uids {
        let _ = writeln!(out, "request remove {uid}");
    }

    out.push_str("end\n");
    out
}

/// Parse a solver's solution text.
///
/// Accepted lines: `install <uid> <version>`, `remove <uid> [version]`,
/// `try-again`, blank lines, and `#` comments. Anything else is a solver
/// protocol error.
pub fn parse_solution(text: &str) -> Result<SolverVerdict> {
    let mut decisions = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "try-again" {
            return Ok(SolverVerdict::TryAgain);
        }
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("install"), Some(uid), Some(version)) => decisions.push(Decision {
                uid: uid.to_string(),
                version: version.to_string(),
                install: true,
            }),
            (Some("remove"), Some(uid), version) => decisions.push(Decision {
                uid: uid.to_string(),
                version: version.unwrap_or("").to_string(),
                install: false,
            }),
            _ => {
                return Err(Error::Solver(format!(
                    "unparsable solver output line: '{line}'"
                )))
            }
        }
    }
    Ok(SolverVerdict::Selection(decisions))
}

/// The built-in deterministic solver.
///
/// Every add-request selects its narrowed chain candidate; dependencies
/// without an installed provider pull their own candidates in; an
/// installed package conflicting with a selection is scheduled for
/// removal. Two selected packages conflicting with each other cannot be
/// satisfied and fail the solve.
pub fn solve_internal(
    universe: &Universe,
    add: &Request,
    del: &Request,
) -> Result<SolverVerdict> {
    let mut removals: BTreeSet<String> = del.uids().cloned().collect();
    let mut installs: BTreeMap<String, PkgId> = BTreeMap::new();

    let mut worklist: Vec<String> = add.uids().cloned().collect();
    worklist.sort();
    while let Some(uid) = worklist.pop() {
        if installs.contains_key(&uid) || removals.contains(&uid) {
            continue;
        }
        let Some(candidate) = best_candidate(universe, &uid) else {
            continue;
        };
        debug!("solver selects {} for {}", universe.get(candidate), uid);
        installs.insert(uid.clone(), candidate);

        let pkg = universe.get(candidate);
        for dep in &pkg.deps {
            if installs.contains_key(&dep.uid) {
                continue;
            }
            let chain = universe.find(&dep.uid).unwrap_or(&[]);
            let has_local = chain.iter().any(|&id| universe.get(id).is_installed());
            if has_local && !removals.contains(&dep.uid) {
                continue;
            }
            if chain.iter().any(|&id| !universe.get(id).is_installed()) {
                worklist.push(dep.uid.clone());
            } else {
                return Err(Error::Solver(format!(
                    "cannot satisfy dependency {} of {}",
                    dep.uid, pkg.uid
                )));
            }
        }

        for conflict_uid in &pkg.conflicts {
            if installs.contains_key(conflict_uid) {
                return Err(Error::Solver(format!(
                    "{} and {} conflict and are both selected",
                    pkg.uid, conflict_uid
                )));
            }
            let chain = universe.find(conflict_uid).unwrap_or(&[]);
            if chain.iter().any(|&id| universe.get(id).is_installed()) {
                debug!("solver removes {} conflicting with {}", conflict_uid, pkg.uid);
                removals.insert(conflict_uid.clone());
            }
        }
    }

    let mut decisions = Vec::new();
    for uid in &removals {
        let version = universe
            .find(uid)
            .and_then(|chain| {
                chain
                    .iter()
                    .find(|&&id| universe.get(id).is_installed())
                    .map(|&id| universe.get(id).version.clone())
            })
            .unwrap_or_default();
        decisions.push(Decision {
            uid: uid.clone(),
            version,
            install: false,
        });
    }
    for (uid, id) in &installs {
        decisions.push(Decision {
            uid: uid.clone(),
            version: universe.get(*id).version.clone(),
            install: true,
        });
    }
    Ok(SolverVerdict::Selection(decisions))
}

/// Highest-version non-installed chain member for a uid
fn best_candidate(universe: &Universe, uid: &str) -> Option<PkgId> {
    universe
        .find(uid)?
        .iter()
        .copied()
        .filter(|&id| !universe.get(id).is_installed())
        .max_by(|&a, &b| version_cmp(&universe.get(a).version, &universe.get(b).version))
}

/// Run an external solver command with the problem on stdin.
///
/// The command runs through the shell; failure to spawn is fatal, but the
/// exit status is ignored (non-blocking wait), only the output counts.
pub fn run_external(cmd: &str, problem: &str) -> Result<String> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::SolverSpawn(cmd.to_string(), e))?;

    // The solver may stream output before draining its stdin; the problem
    // is written from a separate thread so neither pipe can fill up and
    // stall the other
    let writer = child.stdin.take().map(|mut stdin| {
        let input = problem.to_string();
        std::thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
        })
    });
    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_string(&mut out)?;
    }
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let _ = child.try_wait();

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Dep, Package, PkgType};

    fn remote(uid: &str, version: &str) -> Package {
        Package::new(uid, version, PkgType::Remote)
    }

    fn installed(uid: &str, version: &str) -> Package {
        Package::new(uid, version, PkgType::Installed)
    }

    #[test]
    fn test_parse_solution_round_trip() {
        let verdict = parse_solution("# comment\ninstall curl 8.6.0\nremove old 1.0\n").unwrap();
        let SolverVerdict::Selection(decisions) = verdict else {
            panic!("expected a selection");
        };
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].install);
        assert_eq!(decisions[0].uid, "curl");
        assert!(!decisions[1].install);

        assert_eq!(parse_solution("try-again\n").unwrap(), SolverVerdict::TryAgain);
        assert!(parse_solution("bogus line\n").is_err());
    }

    #[test]
    fn test_internal_solver_selects_and_pulls_deps() {
        let mut u = Universe::new();
        let mut app = remote("app", "1.0");
        app.deps.push(Dep {
            name: "zlib".into(),
            origin: "devel/zlib".into(),
            uid: "zlib".into(),
        });
        u.add_package(app, false).unwrap();
        u.add_package(remote("zlib", "1.3"), false).unwrap();

        let mut add = Request::new();
        add.add_from_universe(&u, "app", false, false);
        let del = Request::new();

        let SolverVerdict::Selection(decisions) = solve_internal(&u, &add, &del).unwrap() else {
            panic!("expected a selection");
        };
        let installs: Vec<&str> = decisions
            .iter()
            .filter(|d| d.install)
            .map(|d| d.uid.as_str())
            .collect();
        assert!(installs.contains(&"app"));
        assert!(installs.contains(&"zlib"));
    }

    #[test]
    fn test_internal_solver_missing_dep_fails() {
        let mut u = Universe::new();
        let mut app = remote("app", "1.0");
        app.deps.push(Dep {
            name: "ghost".into(),
            origin: "misc/ghost".into(),
            uid: "ghost".into(),
        });
        u.add_package(app, false).unwrap();

        let mut add = Request::new();
        add.add_from_universe(&u, "app", false, false);
        let err = solve_internal(&u, &add, &Request::new()).unwrap_err();
        assert!(matches!(err, Error::Solver(_)));
    }

    #[test]
    fn test_internal_solver_removes_conflicting_installed() {
        let mut u = Universe::new();
        u.add_package(installed("oldmta", "1.0"), false).unwrap();
        let mut mta = remote("newmta", "2.0");
        mta.conflicts.push("oldmta".into());
        u.add_package(mta, false).unwrap();

        let mut add = Request::new();
        add.add_from_universe(&u, "newmta", false, false);
        let SolverVerdict::Selection(decisions) =
            solve_internal(&u, &add, &Request::new()).unwrap()
        else {
            panic!("expected a selection");
        };
        assert!(decisions
            .iter()
            .any(|d| !d.install && d.uid == "oldmta" && d.version == "1.0"));
    }

    #[test]
    fn test_encode_problem_is_stable() {
        let mut u = Universe::new();
        u.add_package(remote("b", "1.0"), false).unwrap();
        u.add_package(remote("a", "1.0"), false).unwrap();
        let mut add = Request::new();
        add.add_from_universe(&u, "a", false, false);

        let text = encode_problem(&u, &add, &Request::new());
        let a_pos = text.find("package a").unwrap();
        let b_pos = text.find("package b").unwrap();
        assert!(a_pos < b_pos);
        assert!(text.contains("request install a"));
        assert!(text.starts_with("problem\n"));
        assert!(text.ends_with("end\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_solver_round_trip() {
        // Fake solver: swallow the problem, emit a fixed solution
        let out = run_external("cat >/dev/null; echo 'install curl 8.6.0'", "problem\nend\n")
            .unwrap();
        let verdict = parse_solution(&out).unwrap();
        let SolverVerdict::Selection(decisions) = verdict else {
            panic!("expected a selection");
        };
        assert_eq!(decisions[0].uid, "curl");
    }

    #[cfg(unix)]
    #[test]
    fn test_external_solver_exit_status_is_ignored() {
        let out = run_external(
            "cat >/dev/null; echo 'remove old 1.0'; exit 3",
            "problem\nend\n",
        )
        .unwrap();
        let SolverVerdict::Selection(decisions) = parse_solution(&out).unwrap() else {
            panic!("expected a selection");
        };
        assert_eq!(decisions[0].uid, "old");
        assert!(!decisions[0].install);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_solver_streams_before_reading_stdin() {
        // Both the problem and the leading output exceed a pipe buffer, so
        // a solver that writes first must not wedge the exchange
        let problem = format!("problem\n{}end\n", "# padding line\n".repeat(20_000));
        let out = run_external(
            "yes '# filler' | head -n 20000; cat >/dev/null; echo 'install curl 8.6.0'",
            &problem,
        )
        .unwrap();
        let SolverVerdict::Selection(decisions) = parse_solution(&out).unwrap() else {
            panic!("expected a selection");
        };
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].uid, "curl");
    }

    #[cfg(unix)]
    #[test]
    fn test_external_solver_try_again() {
        let out = run_external("cat >/dev/null; echo try-again", "problem\nend\n").unwrap();
        assert_eq!(parse_solution(&out).unwrap(), SolverVerdict::TryAgain);
    }
}
