use std::net::SocketAddr;
use std::path::PathBuf;

use crate::filesystem::PatternError;

/// Errors raised while building, validating, or running a confined command.
///
/// Compilation, generation, and validation failures are fatal and stop the
/// child from ever starting. Dial failures are handled per connection and
/// monitor failures only disable auditing.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("pattern compilation failed: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("profile generation failed on pattern '{pattern}': {source}")]
    ProfileGenerationFailed {
        pattern: String,
        #[source]
        source: PatternError,
    },

    #[error("profile validation failed: {reason}")]
    ProfileInvalid { reason: String },

    #[error("proxy could not bind {addr}: {source}")]
    ProxyBindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy could not reach '{target}': {reason}")]
    ProxyDialFailed { target: String, reason: String },

    #[error("violation monitor unavailable: {0}")]
    MonitorUnavailable(String),

    #[error("log event skipped: {0}")]
    DecodeSkipped(String),

    #[error("failed to normalise path '{path}': {source}")]
    PathNormalisation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("required tool '{}' is not available", .0.display())]
    ToolUnavailable(PathBuf),

    #[error("sandbox-exec cannot apply a profile here (already inside a sandbox?)")]
    NestedSandboxDetected,

    #[error("confinement requires macOS; this host is '{0}'")]
    UnsupportedOs(String),

    #[error("no command given to run inside the sandbox")]
    NoCommand,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

impl SandboxError {
    /// Whether this error must abort the invocation before the child starts.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SandboxError::ProxyDialFailed { .. }
                | SandboxError::MonitorUnavailable(_)
                | SandboxError::DecodeSkipped(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_phase() {
        let compile = crate::filesystem::compile("/tmp/[abc").unwrap_err();
        let err = SandboxError::from(compile);
        assert!(err.to_string().starts_with("pattern compilation failed"));

        let source = crate::filesystem::compile("/tmp/{a").unwrap_err();
        let err = SandboxError::ProfileGenerationFailed {
            pattern: "/tmp/{a".into(),
            source,
        };
        assert!(err.to_string().starts_with("profile generation failed"));
        assert!(err.to_string().contains("/tmp/{a"));

        let err = SandboxError::ProfileInvalid {
            reason: "missing version".into(),
        };
        assert_eq!(err.to_string(), "profile validation failed: missing version");
    }

    #[test]
    fn recoverable_errors_are_not_fatal() {
        assert!(
            !SandboxError::ProxyDialFailed {
                target: "example.com:443".into(),
                reason: "refused".into()
            }
            .is_fatal()
        );
        assert!(!SandboxError::MonitorUnavailable("no log tool".into()).is_fatal());
        assert!(SandboxError::NoCommand.is_fatal());
    }
}
