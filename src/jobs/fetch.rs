// src/jobs/fetch.rs

//! Download-size and cache-space accounting
//!
//! Before anything is transferred, the pending downloads are summed (minus
//! whatever the cache already holds) and checked against the free space on
//! the cache filesystem. The transfer itself goes through a caller-supplied
//! [`Fetcher`]; dry runs compute the same numbers and transfer nothing.

use crate::error::{Error, Result};
use crate::package::Package;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Transfers one package archive into the cache; supplied by the caller
pub trait Fetcher {
    fn fetch(&mut self, pkg: &Package, dest: &Path) -> Result<()>;
}

/// Cache file path for a remote package
pub fn cache_path(cachedir: &Path, pkg: &Package) -> PathBuf {
    let file_name = pkg
        .repopath
        .as_deref()
        .and_then(|p| Path::new(p).file_name())
        .map(|f| f.to_os_string())
        .unwrap_or_else(|| format!("{}-{}.pkg", pkg.name, pkg.version).into());
    cachedir.join(file_name)
}

/// Bytes of this package already present in the cache, clamped to its size
fn cached_bytes(cachedir: &Path, pkg: &Package) -> u64 {
    match std::fs::metadata(cache_path(cachedir, pkg)) {
        Ok(meta) => meta.len().min(pkg.pkgsize.max(0) as u64),
        Err(_) => 0,
    }
}

/// Sum of `pkgsize - cached bytes` over the given packages
pub fn compute_download_size<'a, I>(cachedir: &Path, packages: I) -> u64
where
    I: IntoIterator<Item = &'a Package>,
{
    let mut total = 0u64;
    for pkg in packages {
        let size = pkg.pkgsize.max(0) as u64;
        total += size.saturating_sub(cached_bytes(cachedir, pkg));
    }
    total
}

/// Create the cache directory and verify it has room for `needed` bytes
pub fn ensure_cache_space(cachedir: &Path, needed: u64) -> Result<()> {
    std::fs::create_dir_all(cachedir)?;
    let available = fs2::available_space(cachedir)?;
    if needed > available {
        return Err(Error::InsufficientSpace {
            cachedir: cachedir.display().to_string(),
            needed,
            available,
        });
    }
    Ok(())
}

/// Download every listed package into the cache.
///
/// The space check runs before any transfer; in dry-run mode the need is
/// computed and reported but nothing is transferred and nothing fails.
pub fn fetch_packages<'a, I>(
    cachedir: &Path,
    packages: I,
    fetcher: &mut dyn Fetcher,
    dry_run: bool,
) -> Result<()>
where
    I: IntoIterator<Item = &'a Package> + Clone,
{
    let needed = compute_download_size(cachedir, packages.clone());
    info!("{} bytes to be downloaded into {}", needed, cachedir.display());
    if dry_run {
        return Ok(());
    }
    ensure_cache_space(cachedir, needed)?;

    for pkg in packages {
        let dest = cache_path(cachedir, pkg);
        if cached_bytes(cachedir, pkg) == pkg.pkgsize.max(0) as u64 && pkg.pkgsize > 0 {
            debug!("{} already cached", pkg);
            continue;
        }
        fetcher.fetch(pkg, &dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PkgType;
    use std::io::Write;

    struct CountingFetcher {
        fetched: Vec<String>,
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&mut self, pkg: &Package, dest: &Path) -> Result<()> {
            std::fs::write(dest, vec![0u8; pkg.pkgsize as usize])?;
            self.fetched.push(pkg.uid.clone());
            Ok(())
        }
    }

    fn remote(uid: &str, size: i64) -> Package {
        let mut p = Package::new(uid, "1.0", PkgType::Remote);
        p.pkgsize = size;
        p.repopath = Some(format!("All/{uid}-1.0.pkg"));
        p
    }

    #[test]
    fn test_download_size_subtracts_cache() {
        let dir = tempfile::tempdir().unwrap();
        let a = remote("a", 100);
        let b = remote("b", 50);

        assert_eq!(compute_download_size(dir.path(), [&a, &b]), 150);

        // Partially cached archive counts only its remainder
        let mut f = std::fs::File::create(dir.path().join("a-1.0.pkg")).unwrap();
        f.write_all(&[0u8; 40]).unwrap();
        assert_eq!(compute_download_size(dir.path(), [&a, &b]), 110);
    }

    #[test]
    fn test_insufficient_space_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_cache_space(dir.path(), u64::MAX).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));
    }

    #[test]
    fn test_dry_run_transfers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = remote("a", 100);
        let mut fetcher = CountingFetcher { fetched: vec![] };

        fetch_packages(dir.path(), [&a], &mut fetcher, true).unwrap();
        assert!(fetcher.fetched.is_empty());
        assert!(!cache_path(dir.path(), &a).exists());
    }

    #[test]
    fn test_fetch_skips_fully_cached() {
        let dir = tempfile::tempdir().unwrap();
        let a = remote("a", 4);
        std::fs::write(dir.path().join("a-1.0.pkg"), b"full").unwrap();
        let b = remote("b", 4);

        let mut fetcher = CountingFetcher { fetched: vec![] };
        fetch_packages(dir.path(), [&a, &b], &mut fetcher, false).unwrap();
        assert_eq!(fetcher.fetched, vec!["b"]);
    }
}
