//! Per-invocation correlation identifiers.

use std::fmt;

/// Token that ties kernel log events back to one sandboxed invocation.
///
/// Built from the supervisor's PID plus a random nonce, so two invocations on
/// the same host never share an ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(format!(
            "ahma-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
