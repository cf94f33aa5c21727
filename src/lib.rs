//! roji - HTTPS reverse proxy with automatic container discovery
//!
//! This library provides a local-development reverse proxy that:
//! - Discovers containers on a shared Docker network and assigns each a
//!   stable hostname under a configured base domain
//! - Follows container start/stop events and keeps a concurrent routing
//!   table up to date, including compose-project hostname reshaping
//! - Forwards HTTPS traffic to discovered backends with longest-prefix path
//!   matching, forwarding-header rewriting, and pooled upstream connections
//! - Generates a local CA and a wildcard server certificate so every
//!   discovered hostname is reachable over HTTPS
//! - Redirects plain HTTP to HTTPS and serves a read-only dashboard

pub mod backend;
pub mod certgen;
pub mod dashboard;
pub mod docker;
pub mod error;
pub mod hostname;
pub mod labels;
pub mod observer;
pub mod proxy;
pub mod router;
pub mod settings;
pub mod status;

/// Package name reported in logs
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version reported in logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
