//! Netmaker Kubernetes API proxy
//!
//! An authenticating reverse proxy for the Kubernetes API server, reachable
//! over a Netmaker WireGuard overlay network. Callers are identified by
//! their overlay source IP and impersonated towards the API server.
//!
//! # Architecture
//!
//! ```text
//! overlay peer ──► reverse proxy ──► impersonation ──► K8s API server
//!                  (port 8085)       (IP → identity)
//!
//! admin client ──► management API ──► mapping store ◄── external sync
//!                  (port 8086)                          (Netmaker API)
//! ```
//!
//! Both listeners bind to the overlay interface address once the Netmaker
//! agent has created it, unless an explicit bind address is configured.

#![deny(missing_docs)]

pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod interface;
pub mod mappings;
pub mod netclient;
pub mod proxy;
pub mod runner;
pub mod server;
pub mod sync;
pub mod upstream;

pub use config::{ProxyConfig, ProxyMode, Settings};
pub use error::{Error, Result};
pub use mappings::{UserMapping, UserMappingStore};

/// Default reverse proxy port
pub const DEFAULT_PROXY_PORT: u16 = 8085;

/// Default management API port
pub const DEFAULT_API_PORT: u16 = 8086;
