use std::path::Path;
use std::process::Command;

use super::error::SandboxError;
use super::validate::{NOOP_COMMAND, SANDBOX_EXEC};

/// Profile that sandbox-exec accepts anywhere it can apply a profile at all.
const PERMISSIVE_PROFILE: &str = "(version 1)(allow default)";

/// Exit status sandbox-exec uses when `sandbox_apply` is refused.
const SANDBOX_APPLY_REFUSED: i32 = 71;

/// Check the host can confine a child before anything is started.
pub fn check_sandbox_prerequisites() -> Result<(), SandboxError> {
    #[cfg(target_os = "macos")]
    {
        check_tool_present(Path::new(SANDBOX_EXEC))
    }

    #[cfg(not(target_os = "macos"))]
    {
        Err(SandboxError::UnsupportedOs(std::env::consts::OS.to_string()))
    }
}

pub fn check_tool_present(tool: &Path) -> Result<(), SandboxError> {
    if tool.is_file() {
        Ok(())
    } else {
        Err(SandboxError::ToolUnavailable(tool.to_path_buf()))
    }
}

/// Apply a permissive profile to a no-op command.
///
/// Fails with [`SandboxError::NestedSandboxDetected`] when this process is
/// itself confined and the kernel refuses a second profile.
pub fn test_sandbox_exec_available() -> Result<(), SandboxError> {
    try_sandbox_exec(Path::new(SANDBOX_EXEC))
}

pub fn try_sandbox_exec(tool: &Path) -> Result<(), SandboxError> {
    let output = Command::new(tool)
        .args(["-p", PERMISSIVE_PROFILE, NOOP_COMMAND])
        .output()
        .map_err(|e| {
            tracing::debug!("sandbox-exec exec failed: {}", e);
            SandboxError::ToolUnavailable(tool.to_path_buf())
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !(stderr.contains("Operation not permitted")
        || stderr.contains("sandbox_apply")
        || output.status.code() == Some(SANDBOX_APPLY_REFUSED))
    {
        tracing::debug!("sandbox-exec trial run failed: {}", stderr.trim());
    }
    Err(SandboxError::NestedSandboxDetected)
}
