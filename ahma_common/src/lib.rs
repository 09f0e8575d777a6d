//! Shared runtime primitives for the ahma sandbox workspace.

pub mod monitor_state;
