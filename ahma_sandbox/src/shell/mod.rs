//! # Shell Module
//!
//! Command-line entry point for the `ahma_sandbox` binary.

pub mod cli;

pub use cli::{Cli, run};
