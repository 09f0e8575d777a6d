//! # macOS Seatbelt Confinement
//!
//! Everything between a [`crate::config::ResolvedPolicy`] and a confined child
//! process: the profile generator and validator, the violation pipeline, and
//! the [`SandboxManager`] that composes them with the network proxies.
//!
//! ## Layout
//!
//! - **`seatbelt`**: pure SBPL text generation.
//! - **`validate`**: static checks plus a live `sandbox-exec` trial run.
//! - **`monitor`**, **`violations`**, **`violation_logger`**: kernel denial
//!   events from `log stream`, their classification, the ignore filter and the
//!   rotating `deny.log`.
//! - **`manager`**: orchestration, signals and teardown.

mod correlation;
mod error;
pub mod manager;
pub mod monitor;
mod prerequisites;
pub mod seatbelt;
pub mod validate;
pub mod violation_logger;
pub mod violations;

pub use correlation::CorrelationId;
pub use error::{SandboxError, SandboxResult};
pub use manager::{DryRunReport, PreparedPolicy, RunOutcome, SandboxManager, child_environment};
pub use monitor::{EventSource, FixtureSource, LogStreamSource, ViolationMonitor};
pub use prerequisites::{
    check_sandbox_prerequisites, check_tool_present, try_sandbox_exec,
    test_sandbox_exec_available,
};
pub use seatbelt::{ProxyPorts, generate_profile};
pub use validate::{ProfileFile, ProfileValidator, check_static};
pub use violation_logger::ViolationLogger;
pub use violations::{Operation, SinkReport, Violation, ViolationSink, should_ignore};
