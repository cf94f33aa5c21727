use anyhow::Context;
use roji::certgen::{CertAuthority, EnsureOutcome};
use roji::docker::{Discovery, DockerEngine};
use roji::observer::{apply_deltas, Observer, DELTA_CHANNEL_CAPACITY};
use roji::proxy::{ProxyServer, UpstreamClient};
use roji::router::{RouteLookup, RoutingTable};
use roji::settings::Settings;
use roji::status::StatusProvider;
use roji::{PKG_NAME, VERSION};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Grace window for in-flight work after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional settings file path as the first argument; defaults otherwise.
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(Path::new(&path))?,
        None => Settings::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("{PKG_NAME}={}", settings.log_level)
                    .parse()
                    .unwrap_or_else(|_| "roji=info".parse().expect("valid log directive")),
            ),
        )
        .init();

    let dashboard_host = settings.dashboard_host();
    info!(name = PKG_NAME, version = VERSION, "starting proxy");
    info!(
        network = %settings.network,
        domain = %settings.base_domain,
        http_port = settings.http_port,
        https_port = settings.https_port,
        dashboard = %dashboard_host,
        certs_dir = %settings.certs_dir.display(),
        "configuration"
    );

    // Certificates first: TLS cannot come up without them.
    let authority = CertAuthority::new(&settings.certs_dir, &settings.base_domain);
    if settings.auto_cert {
        match authority.ensure().context("failed to ensure certificates")? {
            EnsureOutcome::Generated => {
                info!(dir = %settings.certs_dir.display(), "certificates ready");
            }
            EnsureOutcome::Adopted => {
                info!(dir = %settings.certs_dir.display(), "using existing certificates");
                authority.warn_on_domain_mismatch();
            }
        }
    }

    let cert_paths = authority.paths();
    let tls_acceptor = load_tls_acceptor(&cert_paths.server_cert, &cert_paths.server_key)?;

    let engine = Arc::new(DockerEngine::connect().await?);
    let discovery = Arc::new(Discovery::new(
        engine,
        settings.network.clone(),
        settings.base_domain.clone(),
    ));

    let table = Arc::new(RoutingTable::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (delta_tx, delta_rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);

    let observer = Observer::new(Arc::clone(&discovery), shutdown_rx.clone());
    let status = Arc::new(StatusProvider::new(
        Arc::clone(&table),
        observer.connected_flag(),
        cert_paths.server_cert.clone(),
    ));

    // Single writer: deltas are applied to the table in emission order.
    let consumer_handle = tokio::spawn(apply_deltas(Arc::clone(&table), delta_rx));

    observer
        .initial_scan(&delta_tx)
        .await
        .context("initial container discovery failed")?;

    let observer_handle = tokio::spawn(observer.run(delta_tx));

    // Bind both listeners up front so port conflicts fail startup.
    let https_addr = SocketAddr::from(([0, 0, 0, 0], settings.https_port));
    let https_listener = TcpListener::bind(https_addr)
        .await
        .with_context(|| format!("failed to bind HTTPS listener on {https_addr}"))?;

    // One upstream transport per process; clones share the pool.
    let upstream = UpstreamClient::new();

    let https_proxy = ProxyServer::new(
        Arc::clone(&table) as Arc<dyn RouteLookup>,
        Arc::clone(&status),
        dashboard_host.clone(),
        upstream.clone(),
        shutdown_rx.clone(),
    )
    .with_tls(tls_acceptor);
    let https_handle = tokio::spawn(async move {
        if let Err(e) = https_proxy.run(https_listener).await {
            error!(error = %e, "HTTPS proxy server error");
        }
    });

    let http_handle = if settings.http_port > 0 {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;

        let http_proxy = ProxyServer::new(
            Arc::clone(&table) as Arc<dyn RouteLookup>,
            Arc::clone(&status),
            dashboard_host,
            upstream.clone(),
            shutdown_rx.clone(),
        )
        .with_https_redirect(settings.https_port);
        Some(tokio::spawn(async move {
            if let Err(e) = http_proxy.run(http_listener).await {
                error!(error = %e, "HTTP redirect server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Give servers and the observer a bounded window to unwind.
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = https_handle.await;
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        let _ = observer_handle.await;
        let _ = consumer_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    // rustls defaults negotiate TLS 1.2 as the floor, matching the minimum
    // the proxy promises.
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            anyhow::anyhow!("failed to parse certificates from {}: {}", path.display(), e)
        })?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("no private key found in {}", path.display())
}
