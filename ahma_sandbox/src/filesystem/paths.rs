//! Path normalisation for policy entries.
//!
//! Literal entries are expanded (`~`), made absolute, cleaned lexically and,
//! when the target exists, resolved through symlinks. Glob entries only get
//! tilde expansion: their wildcards have to survive untouched until the
//! pattern compiler sees them.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Characters that turn a policy entry into a glob pattern.
const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// Returns `true` if the entry uses any glob syntax.
pub fn contains_glob(path: &str) -> bool {
    path.contains(GLOB_CHARS)
}

/// Expand a leading `~` or `~/` to the current user's home directory.
///
/// Other forms (`~user/…`) are returned unchanged.
pub fn expand_tilde(path: &str) -> io::Result<String> {
    let rest = if path == "~" {
        ""
    } else if let Some(rest) = path.strip_prefix("~/") {
        rest
    } else {
        return Ok(path.to_string());
    };

    let home = dirs::home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
    if rest.is_empty() {
        Ok(home.to_string_lossy().into_owned())
    } else {
        Ok(home.join(rest).to_string_lossy().into_owned())
    }
}

/// Normalise a literal path: expand `~`, make it absolute, clean `.`/`..`
/// and resolve symlinks if the target exists.
pub fn normalise_path(path: &str) -> io::Result<String> {
    let expanded = expand_tilde(path)?;
    let absolute = to_absolute(Path::new(&expanded))?;

    match std::fs::canonicalize(&absolute) {
        Ok(resolved) => Ok(resolved.to_string_lossy().into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Ok(absolute.to_string_lossy().into_owned())
        }
        Err(e) => Err(e),
    }
}

/// Normalise a policy list. Globs keep their shape (tilde expansion only),
/// literal entries get full [`normalise_path`] treatment.
pub fn normalise_paths(paths: &[String]) -> io::Result<Vec<String>> {
    let mut normalised = Vec::with_capacity(paths.len());
    for path in paths {
        let expanded = expand_tilde(path)?;
        if contains_glob(&expanded) {
            normalised.push(expanded);
            continue;
        }
        let norm = normalise_path(&expanded).map_err(|e| {
            io::Error::new(e.kind(), format!("failed to normalise '{path}': {e}"))
        })?;
        normalised.push(norm);
    }
    Ok(normalised)
}

/// Join a relative path onto the current directory and clean it lexically.
pub fn to_absolute(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_path_lexically(&joined))
}

/// Normalize a path lexically (without filesystem access).
pub fn normalize_path_lexically(path: &Path) -> PathBuf {
    let mut stack = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.last().is_some_and(|c| *c != Component::RootDir) {
                    stack.pop();
                }
            }
            c => stack.push(c),
        }
    }

    stack.iter().collect()
}
