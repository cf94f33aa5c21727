//! Request dispatcher: the HTTPS entrypoint and the HTTP redirector
//!
//! Every incoming request is classified as dashboard, matched route, or
//! unmatched. Matched requests are forwarded through the shared upstream
//! client with rewritten forwarding headers and a stripped path prefix;
//! responses stream back without buffering so server-sent events and
//! long-polls work through the proxy.

use crate::dashboard;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::router::RouteLookup;
use crate::status::StatusProvider;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Sleep;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound on the TLS handshake so slow clients cannot pin accept tasks
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on reading a request head
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on a stalled client read while a request is in flight
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on a stalled client write (client not draining the response)
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on a keep-alive connection sitting idle between requests
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Bound on waiting for the upstream's response status line
const UPSTREAM_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Ceiling on idle upstream connections kept per backend
const UPSTREAM_MAX_IDLE_PER_HOST: usize = 10;
/// How long an idle upstream connection is kept for reuse
const UPSTREAM_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Pooled transport for upstream requests.
///
/// Clones share the underlying pool, so construct one per process and hand
/// clones to each listener.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(UPSTREAM_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(UPSTREAM_POOL_IDLE_TIMEOUT)
            .build(connector);

        Self { client }
    }

    /// Retarget the request at a backend and send it through the pool.
    ///
    /// The request is redirected in place: method, headers, and body carry
    /// over untouched, and the response body streams through without
    /// buffering.
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        target_addr: &str,
        path_and_query: &str,
    ) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let uri: Uri = format!("http://{target_addr}{path_and_query}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid upstream uri: {e}"))?;
        *req.uri_mut() = uri;

        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every request handled by one listener.
struct ProxyContext {
    router: Arc<dyn RouteLookup>,
    status: Arc<StatusProvider>,
    upstream: UpstreamClient,
    dashboard_host: String,
}

/// A listening proxy server: HTTPS dispatcher or plain-HTTP redirector.
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    /// If set, every plain-HTTP request is redirected to this HTTPS port
    https_redirect_port: Option<u16>,
}

impl ProxyServer {
    pub fn new(
        router: Arc<dyn RouteLookup>,
        status: Arc<StatusProvider>,
        dashboard_host: impl Into<String>,
        upstream: UpstreamClient,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let context = Arc::new(ProxyContext {
            router,
            status,
            upstream,
            dashboard_host: dashboard_host.into().to_lowercase(),
        });
        Self {
            context,
            shutdown_rx,
            tls_acceptor: None,
            https_redirect_port: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Turn this listener into an HTTP-to-HTTPS redirector.
    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Serve connections on a pre-bound listener until shutdown.
    ///
    /// Binding happens in the caller so a port conflict is a startup error
    /// rather than a logged-and-ignored task failure.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() {
            "HTTPS"
        } else {
            "HTTP"
        };
        info!(addr = %addr, protocol, "proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let https_redirect_port = self.https_redirect_port;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match tokio::time::timeout(
                                        TLS_HANDSHAKE_TIMEOUT,
                                        acceptor.accept(stream),
                                    )
                                    .await
                                    {
                                        Ok(Ok(tls_stream)) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, context, true, None).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Ok(Err(e)) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                        Err(_) => {
                                            debug!(addr = %addr, "TLS handshake timed out");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, context, false, https_redirect_port).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %addr, "proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
    is_tls: bool,
    https_redirect_port: Option<u16>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Read, write, and idle deadlines live on the accepted stream itself so
    // a dribbling or stalled client tears the connection down instead of
    // pinning this task.
    let io = TokioIo::new(TimedStream::new(stream));

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr, is_tls, https_redirect_port).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT)
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
    is_tls: bool,
    https_redirect_port: Option<u16>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if let Some(redirect_port) = https_redirect_port {
        if !is_tls {
            return Ok(build_https_redirect(req.headers(), req.uri(), redirect_port));
        }
    }

    let Some(hostname) = extract_hostname(req.headers()) else {
        return Ok(json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    if hostname == context.dashboard_host {
        let entries = context.router.snapshot();
        let report = context.status.report();
        return Ok(dashboard::respond(req.uri().path(), &entries, &report));
    }

    let path = req.uri().path().to_string();
    let Some(route) = context.router.lookup(&hostname, &path) else {
        warn!(hostname = %hostname, path = %path, "no route found");
        return Ok(json_error_response(
            ProxyErrorCode::NoRoute,
            format!("no route for {hostname}"),
        ));
    };

    let forwarded_path = rewrite_path_and_query(req.uri(), &route.path_prefix);
    let original_host = req.headers().get(hyper::header::HOST).cloned();

    // Strip any client-supplied forwarding headers before setting our own so
    // upstream services never see attacker-controlled values.
    strip_forwarding_headers(req.headers_mut());

    let headers = req.headers_mut();
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    if let Ok(client_ip) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, client_ip.clone());
        headers.insert(X_REAL_IP, client_ip);
    }

    let method = req.method().clone();
    let target = route.backend.target_addr();
    let service = route.backend.service_name.clone();
    let start = Instant::now();

    let result = tokio::time::timeout(
        UPSTREAM_RESPONSE_TIMEOUT,
        context.upstream.forward(req, &target, &forwarded_path),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            info!(
                method = %method,
                host = %hostname,
                path = %path,
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                target = %service,
                "request"
            );
            Ok(response)
        }
        Ok(Err(e)) => {
            error!(hostname = %hostname, target = %target, error = %e, "upstream request failed");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Bad Gateway",
            ))
        }
        Err(_) => {
            error!(
                hostname = %hostname,
                target = %target,
                timeout_secs = UPSTREAM_RESPONSE_TIMEOUT.as_secs(),
                "upstream response timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Bad Gateway",
            ))
        }
    }
}

/// Enforces read, write, and idle deadlines on an accepted client stream.
///
/// While the client is mid-request (bytes seen since the last response
/// write) a stalled read fails after the read timeout; between requests the
/// longer idle timeout governs. Stalled writes fail after the write timeout.
/// A fired deadline surfaces as `TimedOut`, which hyper treats as a dead
/// connection.
struct TimedStream<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    mid_request: bool,
}

impl<S> TimedStream<S> {
    fn new(inner: S) -> Self {
        Self::with_timeouts(
            inner,
            CLIENT_READ_TIMEOUT,
            CLIENT_WRITE_TIMEOUT,
            CLIENT_IDLE_TIMEOUT,
        )
    }

    fn with_timeouts(
        inner: S,
        read_timeout: Duration,
        write_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            idle_timeout,
            read_deadline: None,
            write_deadline: None,
            mid_request: false,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                if buf.filled().len() > filled_before {
                    this.mid_request = true;
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = if this.mid_request {
                    this.read_timeout
                } else {
                    this.idle_timeout
                };
                let deadline = this
                    .read_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                if deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "client read timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                // A response is going out; the next read wait is keep-alive
                // idle rather than mid-request.
                this.mid_request = false;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let deadline = this
                    .write_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(this.write_timeout)));
                if deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "client write timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let deadline = this
                    .write_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(this.write_timeout)));
                if deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "client write timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Extract the request hostname: Host header minus any port, lowercased.
///
/// Length and character validation keeps hostile values out of the routing
/// table lookup and the logs.
fn extract_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// Remove every client-supplied `X-Forwarded-*` and `X-Real-IP` header.
fn strip_forwarding_headers(headers: &mut HeaderMap) {
    let forwarded: Vec<hyper::header::HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name.starts_with("x-forwarded-") || name == X_REAL_IP
        })
        .cloned()
        .collect();
    for name in forwarded {
        headers.remove(name);
    }
}

/// Compute the upstream path: strip the route's prefix and keep the query.
fn rewrite_path_and_query(uri: &Uri, path_prefix: &str) -> String {
    let path = uri.path();
    let stripped = if path_prefix.is_empty() {
        path
    } else {
        path.strip_prefix(path_prefix).unwrap_or(path)
    };
    let stripped = if stripped.is_empty() { "/" } else { stripped };

    match uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    }
}

/// Build a 301 redirect to the same host and path under `https://`.
fn build_https_redirect(
    headers: &HeaderMap,
    uri: &Uri,
    https_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}
