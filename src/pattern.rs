// src/pattern.rs

//! Job patterns and match modes
//!
//! A job pattern is what the caller hands to a transaction: a name, a glob,
//! a regular expression, or a path to a package file. Patterns form an
//! ordered list consumed once per solve.

use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Archive suffixes that make a pattern a package-file candidate
const PKG_FILE_SUFFIXES: &[&str] = &["pkg", "tzst", "txz", "tbz", "tgz", "tar"];

/// How a pattern is matched against package names and uids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchMode {
    /// Case-sensitive equality on name or uid
    Exact,
    /// Shell-style glob
    Glob,
    /// Regular expression
    Regex,
    /// Every package, pattern ignored
    All,
    /// Internal lookups keyed strictly by uid
    Internal,
}

impl MatchMode {
    pub fn as_str(&self) -> &str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Glob => "glob",
            MatchMode::Regex => "regex",
            MatchMode::All => "all",
            MatchMode::Internal => "internal",
        }
    }

    /// Match a single name against a pattern under this mode.
    ///
    /// Used to filter rows where the match cannot be pushed down into SQL
    /// (regex and glob modes).
    pub fn matches(&self, pattern: &str, name: &str) -> bool {
        match self {
            MatchMode::All => true,
            MatchMode::Exact | MatchMode::Internal => pattern == name,
            MatchMode::Glob => glob::Pattern::new(pattern)
                .map(|p| p.matches(name))
                .unwrap_or(false),
            MatchMode::Regex => Regex::new(pattern)
                .map(|re| re.is_match(name))
                .unwrap_or(false),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchMode::Exact),
            "glob" => Ok(MatchMode::Glob),
            "regex" => Ok(MatchMode::Regex),
            "all" => Ok(MatchMode::All),
            "internal" => Ok(MatchMode::Internal),
            _ => Err(format!("Invalid match mode: {s}")),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a job's pattern list
#[derive(Debug, Clone)]
pub struct JobPattern {
    pub pattern: String,
    pub match_mode: MatchMode,
    /// Resolved path when the pattern names a package file ("-" for stdin)
    pub file_path: Option<PathBuf>,
}

impl JobPattern {
    pub fn new(pattern: &str, match_mode: MatchMode) -> Self {
        Self {
            pattern: pattern.to_string(),
            match_mode,
            file_path: None,
        }
    }

    /// Build a pattern, recognizing package-file arguments.
    ///
    /// A pattern with a known archive suffix naming an existing file, or the
    /// literal `-` (read from stdin), becomes a file pattern; anything else
    /// is matched against the catalogs under `match_mode`.
    pub fn from_arg(arg: &str, match_mode: MatchMode) -> Self {
        if arg == "-" {
            return Self {
                pattern: arg.to_string(),
                match_mode,
                file_path: Some(PathBuf::from("-")),
            };
        }

        if let Some((stem, suffix)) = arg.rsplit_once('.') {
            if PKG_FILE_SUFFIXES.contains(&suffix) {
                if let Ok(path) = Path::new(arg).canonicalize() {
                    tracing::debug!("adding file: {}", arg);
                    return Self {
                        pattern: stem.to_string(),
                        match_mode,
                        file_path: Some(path),
                    };
                }
            }
        }

        Self::new(arg, match_mode)
    }

    pub fn is_file(&self) -> bool {
        self.file_path.is_some()
    }
}
