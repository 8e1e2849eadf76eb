// src/shlibs.rs

//! System shared-library inventory
//!
//! Scans the base-system library directories for `lib*.so[.N]` names. The
//! inventory exempts base libraries from the delete cascade and from the
//! shlibs-required comparison of the upgrade predicate: a library owned by
//! the operating system is never a reason to touch a package.

use crate::error::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Directories scanned relative to the system root
const SYSTEM_SHLIB_DIRS: &[&str] = &["lib", "usr/lib"];

/// 32-bit compatibility tree; absence is reported, not fatal
const COMPAT32_DIR: &str = "usr/lib32";

/// Result of a system library scan
#[derive(Debug, Clone, Default)]
pub struct SystemShlibs {
    /// Sorted library file names (`libc.so.7`, ...)
    pub names: Vec<String>,
    /// Set when the 32-bit compatibility tree is missing and 32-bit
    /// shared-library requirements should be ignored
    pub no_compat32: bool,
}

impl SystemShlibs {
    pub fn contains(&self, name: &str) -> bool {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// The inventory as a lookup set for `stringlist_diff`
    pub fn ignore_set(&self) -> std::collections::HashSet<String> {
        self.names.iter().cloned().collect()
    }
}

/// Scan the system library directories beneath `rootdir`.
///
/// Missing directories are skipped; any other I/O failure is fatal.
pub fn scan_system_shlibs(rootdir: &Path) -> Result<SystemShlibs> {
    let mut names = BTreeSet::new();

    for dir in SYSTEM_SHLIB_DIRS {
        scan_dir_for_shlibs(&mut names, &rootdir.join(dir))?;
    }

    let no_compat32 = !rootdir.join(COMPAT32_DIR).is_dir();
    if no_compat32 {
        tracing::debug!("no 32-bit compatibility tree under {}", rootdir.display());
    }

    Ok(SystemShlibs {
        names: names.into_iter().collect(),
        no_compat32,
    })
}

fn scan_dir_for_shlibs(names: &mut BTreeSet<String>, dir: &PathBuf) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            tracing::warn!("Failed to open '{}' to scan for shared libraries", dir.display());
            return Err(e.into());
        }
    };

    for entry in entries {
        let entry = entry?;
        let ft = entry.file_type()?;
        if !ft.is_file() && !ft.is_symlink() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_shlib_name(name) {
            names.insert(name.to_string());
        }
    }

    Ok(())
}

/// Accept `libX.so` and `libX.so.N[.M...]`, nothing shorter or stranger
fn is_shlib_name(name: &str) -> bool {
    // Name can't be shorter than "libx.so"
    if name.len() < 7 || !name.starts_with("lib") {
        return false;
    }

    let bytes = name.as_bytes();
    let mut vers = name.len();
    while vers > 0 && (bytes[vers - 1].is_ascii_digit() || bytes[vers - 1] == b'.') {
        vers -= 1;
    }

    if vers == name.len() {
        return name.ends_with(".so");
    }
    // The stripped tail must be ".N[.M...]" hanging off a ".so" stem
    name[..vers].ends_with(".so")
        && bytes[vers] == b'.'
        && bytes[name.len() - 1].is_ascii_digit()
}
