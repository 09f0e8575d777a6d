//! # Ahma Sandbox
//!
//! Runs an arbitrary command under a macOS Seatbelt profile generated from a
//! high-level policy, and enforces domain-level network rules the kernel
//! cannot express.
//!
//! ## Enforcement layers
//!
//! - **Kernel**: `sandbox-exec -f <profile>` confines filesystem reads, writes,
//!   unlinks and process capabilities. All network access is denied except to
//!   the loopback proxy ports.
//! - **Proxies**: an HTTP/HTTPS proxy and a SOCKS5 proxy bound on `127.0.0.1`
//!   accept or reject each connection by destination domain.
//!
//! Kernel denials are read back from the unified log, matched to the
//! invocation by a correlation ID, classified, and appended to a rotating
//! `deny.log`.
//!
//! ## Modules
//!
//! - **`config`**: the `ResolvedPolicy` model, defaults, JSON loading and overrides.
//! - **`filesystem`**: path normalisation and the glob compiler.
//! - **`network`**: the domain filter and both proxies.
//! - **`sandbox`**: profile generation and validation, violation monitoring,
//!   and the orchestrating `SandboxManager`.
//! - **`package_managers`**: detection of toolchain cache dirs.
//! - **`shell`**: the command-line entry point.

pub mod config;
pub mod filesystem;
pub mod network;
pub mod package_managers;
pub mod sandbox;
pub mod shell;
pub mod utils;
