//! Read-only status snapshot for external collaborators

use crate::router::RoutingTable;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Point-in-time view of the proxy's health.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Number of registered routes
    pub routes: usize,
    /// Whether the observer currently holds an event-stream connection
    pub observer_connected: bool,
    /// Server certificate details, if the certificate could be read
    pub certificate: Option<CertificateStatus>,
}

/// Validity summary of the served certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub subject: String,
    /// Expiry as a unix timestamp
    pub not_after: i64,
    /// Whether the certificate is currently within its validity window
    pub valid: bool,
}

/// Produces [`StatusReport`] snapshots from the live routing table, the
/// observer's connectivity flag, and the certificate on disk.
pub struct StatusProvider {
    table: Arc<RoutingTable>,
    observer_connected: Arc<AtomicBool>,
    server_cert: PathBuf,
}

impl StatusProvider {
    pub fn new(
        table: Arc<RoutingTable>,
        observer_connected: Arc<AtomicBool>,
        server_cert: PathBuf,
    ) -> Self {
        Self {
            table,
            observer_connected,
            server_cert,
        }
    }

    pub fn report(&self) -> StatusReport {
        let certificate = match certificate_status(&self.server_cert) {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(path = %self.server_cert.display(), error = %e, "could not read certificate status");
                None
            }
        };

        StatusReport {
            routes: self.table.len(),
            observer_connected: self.observer_connected.load(Ordering::Relaxed),
            certificate,
        }
    }
}

fn certificate_status(path: &Path) -> Result<CertificateStatus> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
        .map_err(|e| anyhow::anyhow!("invalid PEM in {}: {e}", path.display()))?;
    let cert = pem
        .parse_x509()
        .with_context(|| format!("invalid certificate in {}", path.display()))?;

    Ok(CertificateStatus {
        subject: cert.subject().to_string(),
        not_after: cert.validity().not_after.timestamp(),
        valid: cert.validity().is_valid(),
    })
}
