//! # Logging Initialization
//!
//! One-time setup of the `tracing` subscriber.
//!
//! - **Filter**: `RUST_LOG` wins. Otherwise `<level>,ahma_sandbox=<level>`.
//! - **Stderr (default)**: ANSI colours, so violation warnings stand out next to
//!   the confined command's own output.
//! - **File (`--log-to-file`)**: a daily rolling file in the platform cache dir,
//!   written through a non-blocking appender, no colours. Falls back to stderr
//!   when the directory cannot be written.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Initialize verbose logging for tests.
pub fn init_test_logging() {
    let _ = init_logging("trace", false);
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},ahma_sandbox={log_level}")));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("com", "AhmaSandbox", "ahma_sandbox")
        {
            let log_dir = proj_dirs.cache_dir();

            // rolling::daily panics on permission errors.
            let file_appender_result = if test_write_permission(log_dir) {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tracing_appender::rolling::daily(log_dir, "ahma_sandbox.log")
                }))
            } else {
                Err(Box::new("Cannot write to log directory") as Box<dyn std::any::Any + Send>)
            };

            if let Ok(file_appender) = file_appender_result {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .try_init();
                // Leaked so buffered lines are flushed at exit.
                Box::leak(Box::new(guard));
                return;
            }
        }

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .try_init();
    });

    Ok(())
}

/// Create `dir` if needed and check a file can be written into it.
fn test_write_permission(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let test_file = dir.join(".ahma_sandbox_log_test");
    match std::fs::write(&test_file, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&test_file);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_test_logging();
        init_logging("debug", false).unwrap();
        tracing::debug!("still logging");
    }

    #[test]
    fn write_permission_check_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        assert!(test_write_permission(&nested));
        assert!(nested.is_dir());
        assert!(!nested.join(".ahma_sandbox_log_test").exists());
    }
}
