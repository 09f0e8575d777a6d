//! # Seatbelt Profile Generator
//!
//! Assembles an SBPL profile for `sandbox-exec -f`. Sections are emitted in a
//! fixed order and, inside each section, the broad rule comes before the
//! narrower ones:
//!
//! 1. process capabilities
//! 2. network (deny all, optionally re-allow the loopback proxy ports)
//! 3. reads: allow all, then deny each `denyRead` entry
//! 4. writes: deny all, allow each `allowWrite`, then deny each `denyWrite`
//! 5. unlink: deny all, then allow each `allowUnlink`
//!
//! Entries with glob syntax become `(regex #"…")` filters; anything else is a
//! `(subpath "…")` filter. Generation is a pure function of its inputs, so the
//! same policy always produces byte-identical text.

use std::fmt::Write as _;

use crate::config::{FilesystemPolicy, ProcessPolicy};
use crate::filesystem::{contains_glob, glob_to_regex};

use super::error::{SandboxError, SandboxResult};

/// Loopback ports the child may reach when network access is proxied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyPorts {
    pub http: u16,
    pub socks: u16,
}

/// Generate profile text from already-normalised path lists.
///
/// With a `log_tag`, every deny rule carries `(with message "<tag>")` so the
/// kernel's denial report can be traced back to this invocation.
pub fn generate_profile(
    filesystem: &FilesystemPolicy,
    process: &ProcessPolicy,
    ports: ProxyPorts,
    proxy_enabled: bool,
    log_tag: Option<&str>,
) -> SandboxResult<String> {
    let mut out = ProfileWriter::new(log_tag);

    out.comment("Process");
    out.rule("allow", "process-exec*", None);
    for (granted, operation) in [
        (process.allow_fork, "process-fork"),
        (process.allow_sysctl_read, "sysctl-read"),
        (process.allow_mach_lookup, "mach-lookup"),
        (process.allow_posix_shm, "ipc-posix-shm*"),
    ] {
        if granted {
            out.rule("allow", operation, None);
        }
    }

    if proxy_enabled {
        out.comment("Network: proxies only");
        out.rule("deny", "network*", None);
        for port in [ports.http, ports.socks] {
            out.rule(
                "allow",
                "network*",
                Some(&format!("(remote ip \"localhost:{port}\")")),
            );
        }
    } else {
        out.comment("Network: blocked");
        out.rule("deny", "network*", None);
    }

    out.comment("Reads");
    out.rule("allow", "file-read*", None);
    out.paths("deny", "file-read*", &filesystem.deny_read)?;

    out.comment("Writes");
    out.rule("deny", "file-write*", None);
    out.paths("allow", "file-write*", &filesystem.allow_write)?;
    out.paths("deny", "file-write*", &filesystem.deny_write)?;

    out.comment("Unlink");
    out.rule("deny", "file-write-unlink", None);
    out.paths("allow", "file-write-unlink", &filesystem.allow_unlink)?;

    Ok(out.finish())
}

struct ProfileWriter {
    text: String,
    deny_modifier: Option<String>,
}

impl ProfileWriter {
    fn new(log_tag: Option<&str>) -> Self {
        Self {
            text: String::from("(version 1)\n"),
            deny_modifier: log_tag
                .map(|tag| format!("(with message \"{}\")", escape_string(tag))),
        }
    }

    fn comment(&mut self, title: &str) {
        let _ = write!(self.text, "\n; {title}\n");
    }

    fn rule(&mut self, action: &str, operation: &str, filter: Option<&str>) {
        let _ = write!(self.text, "({action} {operation}");
        if action == "deny"
            && let Some(modifier) = &self.deny_modifier
        {
            let _ = write!(self.text, " {modifier}");
        }
        if let Some(filter) = filter {
            let _ = write!(self.text, " {filter}");
        }
        self.text.push_str(")\n");
    }

    fn paths(&mut self, action: &str, operation: &str, entries: &[String]) -> SandboxResult<()> {
        for entry in entries {
            let filter = path_filter(entry)?;
            self.rule(action, operation, Some(&filter));
        }
        Ok(())
    }

    fn finish(self) -> String {
        self.text
    }
}

fn path_filter(entry: &str) -> SandboxResult<String> {
    if contains_glob(entry) {
        let regex =
            glob_to_regex(entry).map_err(|source| SandboxError::ProfileGenerationFailed {
                pattern: entry.to_string(),
                source,
            })?;
        Ok(format!("(regex #\"{}\")", regex.replace('"', "\\\"")))
    } else {
        Ok(format!("(subpath \"{}\")", escape_string(entry)))
    }
}

fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
