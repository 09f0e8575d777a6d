//! # Network Enforcement
//!
//! Seatbelt can only allow or deny network access by address, so domain-level
//! rules are enforced in user space. The profile confines the child to the
//! loopback proxy ports and the proxies consult a shared [`DomainFilter`] on
//! every connection attempt.

pub mod filter;
pub mod http_proxy;
pub mod proxy;
pub mod socks_proxy;

pub use filter::{DefaultPolicy, DomainFilter, DomainPattern, normalise_domain};
pub use http_proxy::start_http_proxy;
pub use proxy::{ProxyHandle, ProxyKind};
pub use socks_proxy::{ConnectRequest, ConnectionAuthorizer, TargetAddr, start_socks_proxy};
