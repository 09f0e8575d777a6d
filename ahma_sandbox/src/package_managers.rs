//! Package-manager cache detection.
//!
//! Toolchains installed under the user's home (or in well-known system
//! prefixes) keep caches the confined command usually needs to write. Each
//! directory that exists contributes a `<dir>/**` glob to `allowWrite` and
//! `allowUnlink`. Detection is plain existence probing; nothing is read.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Directories outside `$HOME`.
const SYSTEM_DIRS: &[(&str, &str)] = &[
    ("homebrew", "/opt/homebrew"),
    ("homebrew", "/usr/local/Homebrew"),
    ("nix", "/nix/store"),
];

/// Directories relative to `$HOME`.
const HOME_DIRS: &[(&str, &str)] = &[
    ("nix", ".nix-profile"),
    ("nvm", ".nvm"),
    ("fnm", ".fnm"),
    ("nodenv", ".nodenv"),
    ("deno", ".deno"),
    ("bun", ".bun"),
    ("pyenv", ".pyenv"),
    ("poetry", ".poetry"),
    ("pipx", ".local/pipx"),
    ("conda", "miniconda3"),
    ("conda", "anaconda3"),
    ("conda", ".conda"),
    ("go", "go"),
    ("g", ".g"),
    ("sdkman", ".sdkman"),
    ("jenv", ".jenv"),
    ("rbenv", ".rbenv"),
    ("rvm", ".rvm"),
    ("cargo", ".cargo"),
    ("rustup", ".rustup"),
    ("npm", ".npm"),
    ("pip", ".cache/pip"),
    ("uv", ".cache/uv"),
    ("pnpm", ".pnpm-store"),
    ("yarn", ".cache/yarn"),
    ("pnpm", ".local/share/pnpm"),
];

/// Look in the current user's home and the system prefixes.
pub fn detect_package_managers() -> Vec<String> {
    let Some(home) = dirs::home_dir() else {
        debug!("no home directory; skipping package manager detection");
        return Vec::new();
    };
    let system: Vec<(&str, PathBuf)> = SYSTEM_DIRS
        .iter()
        .map(|(tool, dir)| (*tool, PathBuf::from(dir)))
        .collect();
    detect_in(&home, &system)
}

/// Globs for every existing directory, system prefixes first.
pub fn detect_in(home: &Path, system_dirs: &[(&str, PathBuf)]) -> Vec<String> {
    let candidates = system_dirs
        .iter()
        .cloned()
        .chain(HOME_DIRS.iter().map(|(tool, rel)| (*tool, home.join(rel))));

    let mut found = Vec::new();
    for (tool, dir) in candidates {
        if dir.is_dir() {
            debug!(tool, dir = %dir.display(), "package manager directory detected");
            found.push(format!("{}/**", dir.display()));
        }
    }
    found
}
