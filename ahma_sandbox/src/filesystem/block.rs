//! # Blocked-File Scan
//!
//! Finds sensitive files and directories inside writable roots so they can be
//! appended to `denyWrite` before the profile is generated. A writable project
//! dir then still cannot have its `.env` or `.git/hooks` rewritten.
//!
//! ripgrep is used when it can be found; otherwise, or when it fails, the
//! tree is walked directly. Unreadable entries are skipped.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::RipgrepConfig;

use super::glob::{CompiledPattern, PatternError, compile};
use super::paths::contains_glob;

/// A file-name pattern: an exact name or a glob over the name alone.
#[derive(Debug)]
enum NameMatcher {
    Exact(String),
    Glob(CompiledPattern),
}

impl NameMatcher {
    fn new(pattern: &str) -> Result<Self, PatternError> {
        if contains_glob(pattern) {
            Ok(Self::Glob(compile(pattern)?))
        } else {
            Ok(Self::Exact(pattern.to_string()))
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Glob(pattern) => pattern.is_match(name),
        }
    }
}

#[derive(Debug)]
pub struct BlockScanner {
    ripgrep: Option<(PathBuf, Vec<String>)>,
    file_patterns: Vec<String>,
    files: Vec<NameMatcher>,
    dirs: Vec<String>,
}

impl BlockScanner {
    /// Scanner that prefers `ripgrep.command` when it resolves on `PATH`.
    pub fn new(
        files: &[String],
        dirs: &[String],
        ripgrep: &RipgrepConfig,
    ) -> Result<Self, PatternError> {
        let mut scanner = Self::walk_only(files, dirs)?;
        scanner.ripgrep = match which::which(&ripgrep.command) {
            Ok(path) => Some((path, ripgrep.args.clone())),
            Err(e) => {
                debug!(command = %ripgrep.command, error = %e, "ripgrep not found, walking instead");
                None
            }
        };
        Ok(scanner)
    }

    pub fn walk_only(files: &[String], dirs: &[String]) -> Result<Self, PatternError> {
        Ok(Self {
            ripgrep: None,
            file_patterns: files.to_vec(),
            files: files
                .iter()
                .map(|f| NameMatcher::new(f))
                .collect::<Result<_, _>>()?,
            dirs: dirs.to_vec(),
        })
    }

    pub fn uses_ripgrep(&self) -> bool {
        self.ripgrep.is_some()
    }

    /// Every blocked file or directory under `root`, sorted.
    pub fn find(&self, root: &Path) -> BTreeSet<String> {
        if let Some((rg, args)) = &self.ripgrep {
            match self.find_with_ripgrep(rg, args, root) {
                Ok(found) => return found,
                Err(e) => {
                    debug!(root = %root.display(), error = %e, "ripgrep scan failed, walking instead")
                }
            }
        }
        self.find_with_walk(root)
    }

    fn find_with_walk(&self, root: &Path) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut entries = WalkDir::new(root).follow_links(false).into_iter();

        while let Some(entry) = entries.next() {
            let Ok(entry) = entry else { continue };
            if entry.depth() == 0 {
                continue;
            }
            let path = entry.path();

            if self.files.iter().any(|m| m.matches(&entry.file_name().to_string_lossy())) {
                found.insert(path_string(path));
            }
            if entry.file_type().is_dir() && self.dirs.iter().any(|dir| path.ends_with(dir)) {
                found.insert(path_string(path));
                entries.skip_current_dir();
            }
        }

        found
    }

    fn find_with_ripgrep(
        &self,
        rg: &Path,
        args: &[String],
        root: &Path,
    ) -> io::Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();

        for pattern in &self.file_patterns {
            found.extend(run_ripgrep(rg, args, pattern, root)?);
        }

        // rg lists files only, so a blocked dir is recovered from its contents.
        for dir in &self.dirs {
            for line in run_ripgrep(rg, args, &format!("**/{dir}/**"), root)? {
                let hit = Path::new(&line)
                    .ancestors()
                    .find(|a| a.ends_with(dir) && a.starts_with(root) && *a != root);
                if let Some(hit) = hit {
                    found.insert(path_string(hit));
                }
            }
        }

        Ok(found)
    }
}

fn run_ripgrep(rg: &Path, args: &[String], glob: &str, root: &Path) -> io::Result<Vec<String>> {
    let output = Command::new(rg)
        .args(args)
        .arg("--glob")
        .arg(glob)
        .arg(root)
        .output()?;

    // 1 means no match.
    match output.status.code() {
        Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        _ => Err(io::Error::other(format!(
            "{} exited with {}",
            rg.display(),
            output.status
        ))),
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Scan each existing literal directory in `allow_write`.
///
/// Hits whose path contains glob syntax are dropped, since they would be
/// read back as patterns by the profile generator.
pub fn mandatory_deny_paths(allow_write: &[String], scanner: &BlockScanner) -> Vec<String> {
    let mut found = BTreeSet::new();
    for root in allow_write {
        if contains_glob(root) || !Path::new(root).is_dir() {
            continue;
        }
        found.extend(scanner.find(Path::new(root)));
    }

    found
        .into_iter()
        .filter(|path| {
            let literal = !contains_glob(path);
            if !literal {
                debug!(path, "not blocking path with glob characters");
            }
            literal
        })
        .collect()
}
