//! # Domain Filter
//!
//! Decides whether a destination host may be reached through the proxies.
//! Evaluation order is fixed: denied patterns first, then allowed patterns,
//! then the default policy. The filter is built once per invocation and
//! shared read-only by both proxies.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::filesystem::PatternError;
use crate::sandbox::{SandboxError, SandboxResult};

/// Fallback decision when no pattern matches.
///
/// Deserialises from a string. An unrecognised value falls back to
/// [`DefaultPolicy::Allow`] and logs a warning: a typo in the policy must not
/// silently cut a tool off the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum DefaultPolicy {
    Allow,
    #[default]
    Deny,
}

impl DefaultPolicy {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => DefaultPolicy::Allow,
            "deny" => DefaultPolicy::Deny,
            other => {
                warn!(value = other, "unknown network default policy, falling back to allow");
                DefaultPolicy::Allow
            }
        }
    }
}

impl From<String> for DefaultPolicy {
    fn from(value: String) -> Self {
        DefaultPolicy::parse(&value)
    }
}

impl fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultPolicy::Allow => write!(f, "allow"),
            DefaultPolicy::Deny => write!(f, "deny"),
        }
    }
}

/// An exact host name or a `*` wildcard pattern.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    pattern: String,
    wildcard: Option<Regex>,
}

impl DomainPattern {
    pub fn compile(pattern: &str) -> SandboxResult<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if !pattern.contains('*') {
            return Ok(Self {
                pattern,
                wildcard: None,
            });
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).map_err(|source| {
            SandboxError::InvalidPattern(PatternError::Regex {
                pattern: pattern.clone(),
                source,
            })
        })?;

        Ok(Self {
            pattern,
            wildcard: Some(regex),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    /// `host` must already be normalised.
    fn matches(&self, host: &str) -> bool {
        match &self.wildcard {
            Some(regex) => regex.is_match(host),
            None => self.pattern == host,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainFilter {
    default_policy: DefaultPolicy,
    allowed: Vec<DomainPattern>,
    denied: Vec<DomainPattern>,
}

impl DomainFilter {
    pub fn new(
        default_policy: DefaultPolicy,
        allowed: &[String],
        denied: &[String],
    ) -> SandboxResult<Self> {
        let compile_all = |list: &[String]| {
            list.iter()
                .map(|p| DomainPattern::compile(p))
                .collect::<SandboxResult<Vec<_>>>()
        };

        Ok(Self {
            default_policy,
            allowed: compile_all(allowed)?,
            denied: compile_all(denied)?,
        })
    }

    pub fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    pub fn is_allowed(&self, domain: &str) -> bool {
        let host = normalise_domain(domain);

        if self.denied.iter().any(|p| p.matches(&host)) {
            return false;
        }
        if self.allowed.iter().any(|p| p.matches(&host)) {
            return true;
        }
        self.default_policy == DefaultPolicy::Allow
    }
}

/// Lowercase, trim, and drop a trailing `:port`.
///
/// `[v6]:port` and `[v6]` lose their brackets. A bare IPv6 address has more
/// than one colon and is left alone.
pub fn normalise_domain(domain: &str) -> String {
    let domain = domain.trim();

    if let Some(rest) = domain.strip_prefix('[')
        && let Some(end) = rest.find(']')
    {
        return rest[..end].to_ascii_lowercase();
    }

    let host = match domain.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => domain,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn deny_wins_over_allow() {
        let filter = DomainFilter::new(
            DefaultPolicy::Allow,
            &strings(&["*.example.com", "api.example.com"]),
            &strings(&["api.example.com"]),
        )
        .unwrap();

        assert!(!filter.is_allowed("api.example.com"));
        assert!(filter.is_allowed("www.example.com"));
    }

    #[test]
    fn default_deny_with_empty_allow_list_blocks_everything() {
        let filter = DomainFilter::new(DefaultPolicy::Deny, &[], &[]).unwrap();
        for host in ["github.com", "localhost", "10.0.0.1", ""] {
            assert!(!filter.is_allowed(host), "{host}");
        }
    }

    #[test]
    fn default_allow_with_empty_deny_list_admits_everything() {
        let filter = DomainFilter::new(DefaultPolicy::Allow, &[], &[]).unwrap();
        for host in ["github.com", "localhost", "10.0.0.1"] {
            assert!(filter.is_allowed(host), "{host}");
        }
    }

    #[test]
    fn exact_patterns_do_not_match_subdomains() {
        let filter =
            DomainFilter::new(DefaultPolicy::Deny, &strings(&["github.com"]), &[]).unwrap();
        assert!(filter.is_allowed("github.com"));
        assert!(!filter.is_allowed("api.github.com"));
        assert!(!filter.is_allowed("github.com.evil.net"));
    }

    #[test]
    fn wildcards_match_subdomains_only() {
        let filter =
            DomainFilter::new(DefaultPolicy::Deny, &strings(&["*.npmjs.org"]), &[]).unwrap();
        assert!(filter.is_allowed("registry.npmjs.org"));
        assert!(filter.is_allowed("a.b.npmjs.org"));
        assert!(!filter.is_allowed("npmjs.org"));
        assert!(!filter.is_allowed("npmjs.org.attacker.io"));
    }

    #[test]
    fn matching_ignores_case_and_port() {
        let filter =
            DomainFilter::new(DefaultPolicy::Deny, &strings(&["GitHub.com"]), &[]).unwrap();
        assert!(filter.is_allowed("GITHUB.COM:443"));
        assert!(filter.is_allowed("github.com."));
    }

    #[test]
    fn normalises_ip_literals() {
        assert_eq!(normalise_domain("[::1]:8080"), "::1");
        assert_eq!(normalise_domain("::1"), "::1");
        assert_eq!(normalise_domain("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(normalise_domain(" Example.COM "), "example.com");
    }

    #[test]
    fn default_policy_parses_with_allow_fallback() {
        assert_eq!(DefaultPolicy::parse("deny"), DefaultPolicy::Deny);
        assert_eq!(DefaultPolicy::parse("ALLOW"), DefaultPolicy::Allow);
        assert_eq!(DefaultPolicy::parse("block"), DefaultPolicy::Allow);

        let parsed: DefaultPolicy = serde_json::from_str("\"nonsense\"").unwrap();
        assert_eq!(parsed, DefaultPolicy::Allow);
        assert_eq!(serde_json::to_string(&DefaultPolicy::Deny).unwrap(), "\"deny\"");
    }

    #[test]
    fn regex_metacharacters_in_domains_are_literal() {
        let filter =
            DomainFilter::new(DefaultPolicy::Deny, &strings(&["*.a.b"]), &[]).unwrap();
        assert!(filter.is_allowed("x.a.b"));
        assert!(!filter.is_allowed("x.aXb"));
    }
}
