//! Shared runtime utilities for the Netmaker Kubernetes bridge
//!
//! Small building blocks used by the bridge binaries: one-shot environment
//! access, bounded linear backoff polling, signal-driven shutdown and
//! tracing initialization.

#![deny(missing_docs)]

pub mod env;
pub mod retry;
pub mod shutdown;
pub mod telemetry;

pub use env::{EnvSource, OsEnv};
pub use retry::{poll_with_backoff, LinearBackoff, PollOutcome};
pub use shutdown::shutdown_token;

/// Default name of the network interface created by the Netmaker agent
pub const DEFAULT_INTERFACE_NAME: &str = "netmaker";
