//! Filesystem side of the policy: path normalisation, the glob compiler that
//! feeds Seatbelt `regex` filters, and the blocked-file scan.

pub mod block;
pub mod glob;
pub mod paths;

pub use block::{BlockScanner, mandatory_deny_paths};
pub use glob::{CompiledPattern, PatternError, compile, glob_to_regex};
pub use paths::{contains_glob, expand_tilde, normalise_path, normalise_paths};
