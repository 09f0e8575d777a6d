//! # Profile Validator
//!
//! A profile is trusted only after two checks pass:
//!
//! 1. **Static**: exactly one `(version 1)` declaration, balanced parentheses,
//!    at least one `(allow …)` or `(deny …)` rule.
//! 2. **Dynamic**: `sandbox-exec -f <profile> /usr/bin/true` exits 0.
//!
//! The static phase short-circuits, so the native tool never sees a profile
//! that cannot parse.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use super::error::{SandboxError, SandboxResult};

pub const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";
pub const NOOP_COMMAND: &str = "/usr/bin/true";

/// A generated profile written to a temporary `.sb` file.
///
/// The file is removed when the value is dropped.
#[derive(Debug)]
pub struct ProfileFile {
    file: NamedTempFile,
    contents: String,
}

impl ProfileFile {
    pub fn write(contents: String) -> SandboxResult<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("ahma-profile-")
            .suffix(".sb")
            .tempfile()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(Self { file, contents })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Remove the file now and report any error doing so.
    pub fn close(self) -> SandboxResult<()> {
        self.file.close()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProfileValidator {
    tool: PathBuf,
    command: PathBuf,
}

impl Default for ProfileValidator {
    fn default() -> Self {
        Self {
            tool: PathBuf::from(SANDBOX_EXEC),
            command: PathBuf::from(NOOP_COMMAND),
        }
    }
}

impl ProfileValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different sandbox tool binary.
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Use a different no-op command for the dynamic check.
    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Run both phases against a profile that is already on disk.
    pub async fn validate(&self, profile: &ProfileFile) -> SandboxResult<()> {
        check_static(profile.contents())?;
        self.check_dynamic(profile.path()).await
    }

    /// Write `text` to a temporary file and validate it.
    pub async fn validate_text(&self, text: &str) -> SandboxResult<()> {
        check_static(text)?;
        let file = ProfileFile::write(text.to_string())?;
        self.check_dynamic(file.path()).await
    }

    async fn check_dynamic(&self, path: &Path) -> SandboxResult<()> {
        let output = Command::new(&self.tool)
            .arg("-f")
            .arg(path)
            .arg(&self.command)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SandboxError::ToolUnavailable(self.tool.clone()),
                _ => SandboxError::ProfileInvalid {
                    reason: format!("could not run {}: {e}", self.tool.display()),
                },
            })?;

        if output.status.success() {
            debug!(profile = %path.display(), "profile accepted by sandbox tool");
            return Ok(());
        }

        let mut diagnostics = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            if !diagnostics.is_empty() {
                diagnostics.push('\n');
            }
            diagnostics.push_str(stdout.trim());
        }

        Err(SandboxError::ProfileInvalid {
            reason: format!(
                "{} rejected the profile ({}): {}",
                self.tool.display(),
                output.status,
                diagnostics
            ),
        })
    }
}

/// Cheap syntactic checks that need no external tool.
pub fn check_static(profile: &str) -> SandboxResult<()> {
    let invalid = |reason: &str| {
        Err(SandboxError::ProfileInvalid {
            reason: reason.to_string(),
        })
    };

    match profile.matches("(version 1)").count() {
        0 => return invalid("missing (version 1) declaration"),
        1 => {}
        _ => return invalid("more than one (version 1) declaration"),
    }
    if !has_balanced_parentheses(profile) {
        return invalid("unbalanced parentheses");
    }
    if !profile.contains("(allow ") && !profile.contains("(deny ") {
        return invalid("no allow or deny rules");
    }
    Ok(())
}

/// Depth counter that never goes negative. Parentheses inside string
/// literals and `;` comments are not counted.
pub fn has_balanced_parentheses(profile: &str) -> bool {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;

    for c in profile.chars() {
        if in_comment {
            in_comment = c != '\n';
            continue;
        }
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            ';' => in_comment = true,
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            _ => {}
        }
    }

    depth == 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "(version 1)\n(allow default)\n";

    #[test]
    fn balanced_parentheses() {
        assert!(has_balanced_parentheses(""));
        assert!(has_balanced_parentheses("(version 1) (allow file-read*)"));
        assert!(has_balanced_parentheses("(allow (subpath \"/home\"))"));
        assert!(!has_balanced_parentheses("(version 1) (allow file-read*"));
        assert!(!has_balanced_parentheses("(version 1)) (allow file-read*)"));
        assert!(!has_balanced_parentheses(")("));
    }

    #[test]
    fn parentheses_in_strings_and_comments_are_ignored() {
        assert!(has_balanced_parentheses(
            "(deny file-read* (subpath \"/a(b\"))\n; comment with ( paren\n"
        ));
        assert!(has_balanced_parentheses(
            r#"(deny file-read* (regex #"^/x/\(c\)\"$"))"#
        ));
    }

    #[test]
    fn static_check_accepts_minimal_profile() {
        check_static(MINIMAL).unwrap();
    }

    #[test]
    fn static_check_rejects_malformed_profiles() {
        let cases = [
            ("(deny default)\n(allow file-read*)", "version"),
            ("(version 1)\n(deny default\n(allow file-read*)", "unbalanced"),
            ("(version 1)\n", "no allow or deny"),
            ("(version 1)\n(version 1)\n(allow default)", "more than one"),
        ];
        for (profile, expected) in cases {
            match check_static(profile) {
                Err(SandboxError::ProfileInvalid { reason }) => {
                    assert!(reason.contains(expected), "{reason} for {profile:?}")
                }
                other => panic!("expected ProfileInvalid for {profile:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn profile_file_is_removed_on_drop() {
        let file = ProfileFile::write(MINIMAL.to_string()).unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), MINIMAL);
        assert!(path.extension().is_some_and(|e| e == "sb"));
        drop(file);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    mod dynamic {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn stub_tool(dir: &TempDir, name: &str, script: &str) -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn accepting_tool_passes() {
            let dir = TempDir::new().unwrap();
            let tool = stub_tool(&dir, "ok", "exit 0");
            ProfileValidator::new()
                .with_tool(tool)
                .validate_text(MINIMAL)
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn rejecting_tool_surfaces_diagnostics() {
            let dir = TempDir::new().unwrap();
            let tool = stub_tool(&dir, "reject", "echo 'unbound variable: bogus' >&2\nexit 65");
            let err = ProfileValidator::new()
                .with_tool(tool)
                .validate_text(MINIMAL)
                .await
                .unwrap_err();
            match err {
                SandboxError::ProfileInvalid { reason } => {
                    assert!(reason.contains("unbound variable: bogus"), "{reason}")
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn static_failure_never_invokes_tool() {
            let dir = TempDir::new().unwrap();
            let marker = dir.path().join("invoked");
            let tool = stub_tool(&dir, "record", &format!("touch '{}'", marker.display()));

            let result = ProfileValidator::new()
                .with_tool(tool)
                .validate_text("(allow default)")
                .await;
            assert!(matches!(result, Err(SandboxError::ProfileInvalid { .. })));
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn tool_receives_profile_path_and_command() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("args");
            let tool = stub_tool(&dir, "args", &format!("echo \"$@\" > '{}'", log.display()));

            let profile = ProfileFile::write(MINIMAL.to_string()).unwrap();
            ProfileValidator::new()
                .with_tool(tool)
                .validate(&profile)
                .await
                .unwrap();

            let args = std::fs::read_to_string(&log).unwrap();
            assert_eq!(
                args.trim(),
                format!("-f {} {}", profile.path().display(), NOOP_COMMAND)
            );
        }

        #[tokio::test]
        async fn missing_tool_is_reported() {
            let err = ProfileValidator::new()
                .with_tool("/nonexistent/sandbox-exec")
                .validate_text(MINIMAL)
                .await
                .unwrap_err();
            assert!(matches!(err, SandboxError::ToolUnavailable(_)));
        }
    }
}
