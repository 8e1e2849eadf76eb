// src/version.rs

//! Package version parsing and ordering
//!
//! Versions follow the `version[_revision][,epoch]` convention of binary
//! package repositories: `1.2.3`, `1.2.3_4`, `1.2.3_4,1`. Ordering compares
//! the epoch first, then the dotted version segments with digit runs
//! compared numerically, then the port revision.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A parsed package version with version, revision, and epoch components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PkgVersion {
    pub version: String,
    pub revision: u64,
    pub epoch: u64,
}

impl PkgVersion {
    /// Parse a package version string
    ///
    /// Examples:
    /// - "1.2.3" → version="1.2.3", revision=0, epoch=0
    /// - "1.2.3_4" → version="1.2.3", revision=4, epoch=0
    /// - "1.2.3_4,1" → version="1.2.3", revision=4, epoch=1
    pub fn parse(s: &str) -> Result<Self> {
        let (rest, epoch) = match s.rsplit_once(',') {
            Some((r, e)) => {
                let epoch = e.parse::<u64>().map_err(|err| {
                    Error::InvalidVersion(s.to_string(), format!("bad epoch: {err}"))
                })?;
                (r, epoch)
            }
            None => (s, 0),
        };

        let (version, revision) = match rest.rsplit_once('_') {
            Some((v, r)) => {
                let revision = r.parse::<u64>().map_err(|err| {
                    Error::InvalidVersion(s.to_string(), format!("bad revision: {err}"))
                })?;
                (v, revision)
            }
            None => (rest, 0),
        };

        if version.is_empty() {
            return Err(Error::InvalidVersion(
                s.to_string(),
                "empty version component".to_string(),
            ));
        }

        Ok(Self {
            version: version.to_string(),
            revision,
            epoch,
        })
    }

    /// Compare two package versions
    pub fn compare(&self, other: &PkgVersion) -> Ordering {
        match self.epoch.cmp(&other.epoch) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match cmp_segments(&self.version, &other.version) {
            Ordering::Equal => {}
            ord => return ord,
        }

        self.revision.cmp(&other.revision)
    }
}

impl PartialOrd for PkgVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PkgVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for PkgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if self.revision > 0 {
            write!(f, "_{}", self.revision)?;
        }
        if self.epoch > 0 {
            write!(f, ",{}", self.epoch)?;
        }
        Ok(())
    }
}

/// Compare two raw version strings without parsing revision/epoch markers
///
/// Convenience for callers holding plain strings; falls back to a direct
/// segment comparison when either side fails to parse.
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    match (PkgVersion::parse(a), PkgVersion::parse(b)) {
        (Ok(va), Ok(vb)) => va.compare(&vb),
        _ => cmp_segments(a, b),
    }
}

/// Compare dotted version strings, digit runs numerically, letter runs
/// lexically. A missing segment sorts before any present one.
fn cmp_segments(a: &str, b: &str) -> Ordering {
    let mut sa = a.split('.');
    let mut sb = b.split('.');

    loop {
        match (sa.next(), sb.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match cmp_chunked(x, y) {
                Ordering::Equal => {}
                ord => return ord,
            },
        }
    }
}

/// Compare one segment as alternating digit/letter chunks
fn cmp_chunked(a: &str, b: &str) -> Ordering {
    let mut ca = a.as_bytes();
    let mut cb = b.as_bytes();

    while !ca.is_empty() || !cb.is_empty() {
        let (na, ra) = take_chunk(ca);
        let (nb, rb) = take_chunk(cb);

        let ord = match (na, nb) {
            (Chunk::Num(x), Chunk::Num(y)) => x.cmp(&y),
            // Numeric chunks sort after alphabetic ones (1.a < 1.0)
            (Chunk::Num(_), Chunk::Alpha(_)) => Ordering::Greater,
            (Chunk::Alpha(_), Chunk::Num(_)) => Ordering::Less,
            (Chunk::Alpha(x), Chunk::Alpha(y)) => x.cmp(y),
            (Chunk::End, Chunk::End) => Ordering::Equal,
            (Chunk::End, _) => Ordering::Less,
            (_, Chunk::End) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }

        ca = ra;
        cb = rb;
    }

    Ordering::Equal
}

enum Chunk<'a> {
    Num(u64),
    Alpha(&'a [u8]),
    End,
}

fn take_chunk(s: &[u8]) -> (Chunk<'_>, &[u8]) {
    if s.is_empty() {
        return (Chunk::End, s);
    }
    if s[0].is_ascii_digit() {
        let end = s.iter().position(|c| !c.is_ascii_digit()).unwrap_or(s.len());
        let num = std::str::from_utf8(&s[..end])
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0);
        (Chunk::Num(num), &s[end..])
    } else {
        let end = s.iter().position(|c| c.is_ascii_digit()).unwrap_or(s.len());
        (Chunk::Alpha(&s[..end]), &s[end..])
    }
}
