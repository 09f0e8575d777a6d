//! # Sandbox Policy Configuration
//!
//! The [`ResolvedPolicy`] is the single input the sandbox core consumes. It is
//! assembled from three layers, later layers winning key by key:
//!
//! 1. Built-in defaults ([`ResolvedPolicy::default`]).
//! 2. A JSON settings file (`--config`, or `settings.json` in the platform
//!    config dir when present).
//! 3. An override (`--settings`), given either as a path or as inline JSON.
//!
//! Keys use camelCase. Any section or field omitted from a layer keeps the
//! value from the layer beneath it.
//!
//! ```json
//! {
//!   "network": { "defaultPolicy": "deny", "allowedDomains": ["github.com"] },
//!   "filesystem": { "denyRead": ["~/.ssh"], "allowWrite": ["."] },
//!   "ignoreViolations": { "*": ["/usr/bin"] }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::network::DefaultPolicy;
use crate::sandbox::{SandboxError, SandboxResult};

/// Environment variable carrying the per-invocation correlation ID.
pub const SANDBOX_ID_ENV: &str = "AHMA_SANDBOX_ID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolvedPolicy {
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
    pub process: ProcessPolicy,
    /// Process name (or `*`) to target substrings that are not logged.
    pub ignore_violations: BTreeMap<String, Vec<String>>,
    pub detect_package_managers: bool,
    /// File names (or name globs) that stay read-only inside allowWrite dirs.
    pub scan_and_block_files: Vec<String>,
    /// Directories that stay read-only inside allowWrite dirs. Entries may
    /// span several components, like `.git/hooks`.
    pub scan_and_block_dirs: Vec<String>,
    pub ripgrep: RipgrepConfig,
    /// Durable violation log. Defaults to `deny.log` in the data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicy {
    pub default_policy: DefaultPolicy,
    pub allowed_domains: Vec<String>,
    pub denied_domains: Vec<String>,
    /// 0 picks an ephemeral port.
    pub http_proxy_port: u16,
    pub socks_proxy_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilesystemPolicy {
    pub deny_read: Vec<String>,
    pub allow_write: Vec<String>,
    pub deny_write: Vec<String>,
    pub allow_unlink: Vec<String>,
}

/// How to invoke ripgrep for the blocked-file scan. Without it on `PATH` the
/// scan walks directories itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RipgrepConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessPolicy {
    pub allow_fork: bool,
    pub allow_sysctl_read: bool,
    pub allow_mach_lookup: bool,
    pub allow_posix_shm: bool,
}

impl Default for ResolvedPolicy {
    fn default() -> Self {
        Self {
            network: NetworkPolicy::default(),
            filesystem: FilesystemPolicy::default(),
            process: ProcessPolicy::default(),
            ignore_violations: BTreeMap::new(),
            detect_package_managers: true,
            scan_and_block_files: [
                ".env",
                ".env.*",
                ".envrc",
                ".bashrc",
                ".bash_profile",
                ".zshrc",
                ".zprofile",
                ".profile",
                ".gitconfig",
                ".gitmodules",
                ".npmrc",
                ".pypirc",
                ".netrc",
                ".mcp.json",
            ]
            .map(String::from)
            .to_vec(),
            scan_and_block_dirs: [".git/hooks", ".vscode", ".idea"]
                .map(String::from)
                .to_vec(),
            ripgrep: RipgrepConfig::default(),
            violation_log: None,
        }
    }
}

impl Default for RipgrepConfig {
    fn default() -> Self {
        Self {
            command: "rg".to_string(),
            args: ["--files", "--hidden", "--no-ignore", "--no-messages"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Deny,
            allowed_domains: Vec::new(),
            denied_domains: Vec::new(),
            http_proxy_port: 0,
            socks_proxy_port: 0,
        }
    }
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            deny_read: list(&["~/.ssh", "~/.gnupg", "~/.aws"]),
            allow_write: list(&[".", "/tmp", "/private/tmp", "/private/var/folders"]),
            deny_write: list(&["**/.env", "**/.git/hooks/**"]),
            allow_unlink: list(&["."]),
        }
    }
}

impl Default for ProcessPolicy {
    fn default() -> Self {
        Self {
            allow_fork: true,
            allow_sysctl_read: true,
            allow_mach_lookup: true,
            allow_posix_shm: true,
        }
    }
}

impl NetworkPolicy {
    /// Proxies are needed whenever some destination may be reachable.
    pub fn requires_proxy(&self) -> bool {
        !self.allowed_domains.is_empty() || self.default_policy == DefaultPolicy::Allow
    }
}

impl ResolvedPolicy {
    /// Reject policies that are malformed or dangerously broad.
    pub fn validate(&self) -> SandboxResult<()> {
        for (list, domains) in [
            ("allowedDomains", &self.network.allowed_domains),
            ("deniedDomains", &self.network.denied_domains),
        ] {
            for domain in domains {
                validate_domain(domain).map_err(|reason| {
                    SandboxError::Config(format!("network.{list}: '{domain}' {reason}"))
                })?;
            }
        }

        for (list, paths) in [
            ("denyRead", &self.filesystem.deny_read),
            ("allowWrite", &self.filesystem.allow_write),
            ("denyWrite", &self.filesystem.deny_write),
            ("allowUnlink", &self.filesystem.allow_unlink),
        ] {
            if paths.iter().any(|p| p.trim().is_empty()) {
                return Err(SandboxError::Config(format!(
                    "filesystem.{list}: paths cannot be empty"
                )));
            }
        }

        for (list, names) in [
            ("scanAndBlockFiles", &self.scan_and_block_files),
            ("scanAndBlockDirs", &self.scan_and_block_dirs),
        ] {
            if names.iter().any(|n| n.trim().is_empty() || n.starts_with('/')) {
                return Err(SandboxError::Config(format!(
                    "{list}: entries must be non-empty relative names"
                )));
            }
        }

        Ok(())
    }
}

fn domain_grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        Regex::new(
            r"^(\*\.)?[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .expect("domain grammar regex must compile")
    })
}

fn validate_domain(domain: &str) -> Result<(), &'static str> {
    if domain.is_empty() {
        return Err("cannot be empty");
    }
    if domain == "*" || domain == "*.*" {
        return Err("is an overly broad pattern");
    }
    if let Some(rest) = domain.strip_prefix("*.")
        && !rest.contains('.')
    {
        return Err("is a TLD-only wildcard");
    }
    if !domain_grammar().is_match(domain) {
        return Err("is not a valid domain pattern");
    }
    Ok(())
}

/// Location of the user's settings file, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "AhmaSandbox", "ahma_sandbox")
        .map(|dirs| dirs.config_dir().join("settings.json"))
}

/// Default location of the durable violation log.
pub fn default_violation_log() -> Option<PathBuf> {
    ProjectDirs::from("com", "AhmaSandbox", "ahma_sandbox")
        .map(|dirs| dirs.data_dir().join("deny.log"))
}

/// Load the policy from `path`, or from [`default_config_path`] when it
/// exists, layered over the built-in defaults.
pub fn load(path: Option<&Path>) -> SandboxResult<ResolvedPolicy> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let Some(path) = path else {
        debug!("no settings file, using built-in defaults");
        return Ok(ResolvedPolicy::default());
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        SandboxError::Config(format!("cannot read settings file '{}': {e}", path.display()))
    })?;
    let layer: Value = serde_json::from_str(&contents).map_err(|e| {
        SandboxError::Config(format!("cannot parse settings file '{}': {e}", path.display()))
    })?;

    debug!(path = %path.display(), "loaded settings file");
    apply_layer(&ResolvedPolicy::default(), layer)
}

/// Parse an override layer given as a file path or as inline JSON.
pub fn parse_override(input: &str) -> SandboxResult<Value> {
    let path = Path::new(input);
    let text = if path.is_file() {
        std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("cannot read override file '{input}': {e}"))
        })?
    } else {
        input.to_string()
    };

    let layer: Value = serde_json::from_str(&text)
        .map_err(|e| SandboxError::Config(format!("invalid override JSON: {e}")))?;
    if !layer.is_object() {
        return Err(SandboxError::Config(
            "override must be a JSON object".to_string(),
        ));
    }
    Ok(layer)
}

/// Lay `layer` over `base` and validate the result.
pub fn apply_layer(base: &ResolvedPolicy, layer: Value) -> SandboxResult<ResolvedPolicy> {
    let mut merged = serde_json::to_value(base)
        .map_err(|e| SandboxError::Config(format!("cannot serialise policy: {e}")))?;
    merge_json(&mut merged, layer);

    let policy: ResolvedPolicy = serde_json::from_value(merged)
        .map_err(|e| SandboxError::Config(format!("invalid settings: {e}")))?;
    policy.validate()?;
    Ok(policy)
}

/// Objects merge key by key. Anything else, arrays included, is replaced.
fn merge_json(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn defaults_deny_network_and_protect_credentials() {
        let policy = ResolvedPolicy::default();
        assert_eq!(policy.network.default_policy, DefaultPolicy::Deny);
        assert!(!policy.network.requires_proxy());
        assert!(policy.filesystem.deny_read.contains(&"~/.ssh".to_string()));
        assert!(policy.filesystem.allow_write.contains(&".".to_string()));
        assert!(policy.process.allow_fork);
        assert!(policy.detect_package_managers);
        policy.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_unspecified_defaults() {
        let policy: ResolvedPolicy =
            serde_json::from_str(r#"{"network":{"allowedDomains":["github.com"]}}"#).unwrap();
        assert_eq!(policy.network.allowed_domains, vec!["github.com"]);
        assert_eq!(policy.network.default_policy, DefaultPolicy::Deny);
        assert_eq!(policy.filesystem, FilesystemPolicy::default());
        assert!(policy.network.requires_proxy());
    }

    #[test]
    fn layers_override_only_present_keys() {
        let base = ResolvedPolicy::default();
        let policy = apply_layer(
            &base,
            json!({
                "filesystem": { "denyRead": ["/secret"] },
                "process": { "allowFork": false },
                "ignoreViolations": { "*": ["/usr/bin"] }
            }),
        )
        .unwrap();

        assert_eq!(policy.filesystem.deny_read, vec!["/secret"]);
        assert_eq!(policy.filesystem.allow_write, base.filesystem.allow_write);
        assert!(!policy.process.allow_fork);
        assert!(policy.process.allow_sysctl_read);
        assert_eq!(policy.ignore_violations["*"], vec!["/usr/bin"]);
    }

    #[test]
    fn rejects_overly_broad_domains() {
        for domain in ["", "*", "*.*", "*.com", "bad domain", "-lead.com"] {
            let mut policy = ResolvedPolicy::default();
            policy.network.allowed_domains = vec![domain.to_string()];
            assert!(
                matches!(policy.validate(), Err(SandboxError::Config(_))),
                "{domain:?} should be rejected"
            );
        }

        let mut policy = ResolvedPolicy::default();
        policy.network.allowed_domains = vec!["*.github.com".into(), "npmjs.org".into()];
        policy.validate().unwrap();
    }

    #[test]
    fn rejects_empty_paths() {
        let mut policy = ResolvedPolicy::default();
        policy.filesystem.deny_write.push("  ".into());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn scan_lists_are_replaced_by_a_layer() {
        let base = ResolvedPolicy::default();
        assert!(base.scan_and_block_files.contains(&".env".to_string()));
        assert!(base.scan_and_block_dirs.contains(&".git/hooks".to_string()));
        assert_eq!(base.ripgrep.command, "rg");

        let policy = apply_layer(
            &base,
            json!({
                "scanAndBlockFiles": ["*.pem"],
                "ripgrep": { "command": "/opt/bin/rg" }
            }),
        )
        .unwrap();
        assert_eq!(policy.scan_and_block_files, vec!["*.pem"]);
        assert_eq!(policy.scan_and_block_dirs, base.scan_and_block_dirs);
        assert_eq!(policy.ripgrep.command, "/opt/bin/rg");
        assert_eq!(policy.ripgrep.args, base.ripgrep.args);

        let mut absolute = base.clone();
        absolute.scan_and_block_dirs.push("/etc".into());
        assert!(absolute.validate().is_err());
    }

    #[test]
    fn invalid_default_policy_fails_open() {
        let policy = apply_layer(
            &ResolvedPolicy::default(),
            json!({ "network": { "defaultPolicy": "blockall" } }),
        )
        .unwrap();
        assert_eq!(policy.network.default_policy, DefaultPolicy::Allow);
    }

    #[test]
    fn override_accepts_inline_json_or_file() {
        let inline = parse_override(r#"{"network":{"defaultPolicy":"allow"}}"#).unwrap();
        assert_eq!(inline["network"]["defaultPolicy"], "allow");

        let dir = tempdir().unwrap();
        let file = dir.path().join("override.json");
        std::fs::write(&file, r#"{"detectPackageManagers":false}"#).unwrap();
        let from_file = parse_override(file.to_str().unwrap()).unwrap();
        assert_eq!(from_file["detectPackageManagers"], false);

        assert!(parse_override("not json").is_err());
        assert!(parse_override("[1,2]").is_err());
    }

    #[test]
    fn load_reads_settings_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(
            &file,
            r#"{"network":{"allowedDomains":["github.com"],"httpProxyPort":18080}}"#,
        )
        .unwrap();

        let policy = load(Some(&file)).unwrap();
        assert_eq!(policy.network.http_proxy_port, 18080);
        assert_eq!(policy.network.socks_proxy_port, 0);

        let missing = load(Some(&dir.path().join("nope.json")));
        assert!(matches!(missing, Err(SandboxError::Config(_))));
    }
}
