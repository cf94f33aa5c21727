//! Dashboard collaborator: read-only views over the routing table
//!
//! Everything here is a pure function of the routing-table snapshot and the
//! status report. Served on the reserved dashboard host only.

use crate::router::RouteEntry;
use crate::status::StatusReport;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};

/// JSON listing of all registered routes
pub const ROUTES_PATH: &str = "/_api/routes";
/// JSON health/status report
pub const HEALTH_PATH: &str = "/_api/health";

/// Answer a request addressed to the dashboard host.
pub fn respond(
    path: &str,
    entries: &[RouteEntry],
    report: &StatusReport,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match path {
        ROUTES_PATH => json_response(
            serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string()),
        ),
        HEALTH_PATH => json_response(
            serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string()),
        ),
        _ => html_response(render_dashboard(entries, report)),
    }
}

fn json_response(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response builder")
}

fn html_response(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response builder")
}

/// Render the route listing page.
pub fn render_dashboard(entries: &[RouteEntry], report: &StatusReport) -> String {
    let rows: String = if entries.is_empty() {
        r#"<tr><td colspan="4" class="empty">No routes registered</td></tr>"#.to_string()
    } else {
        entries
            .iter()
            .map(|entry| {
                let path = if entry.path_prefix.is_empty() {
                    "/"
                } else {
                    entry.path_prefix.as_str()
                };
                format!(
                    r#"<tr><td><a href="https://{host}{path}">{host}{path}</a></td><td>{target}</td><td>{service}</td><td>{container}</td></tr>"#,
                    host = escape(&entry.hostname),
                    path = escape(path),
                    target = escape(&entry.target),
                    service = escape(&entry.service_name),
                    container = escape(&entry.container_name),
                )
            })
            .collect()
    };

    let observer = if report.observer_connected {
        "connected"
    } else {
        "reconnecting"
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>roji</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 60rem; color: #222; }}
h1 {{ font-size: 1.4rem; }}
table {{ border-collapse: collapse; width: 100%; }}
th, td {{ text-align: left; padding: 0.4rem 0.8rem; border-bottom: 1px solid #ddd; }}
th {{ background: #f5f5f5; }}
.empty {{ color: #888; }}
.meta {{ color: #666; font-size: 0.85rem; margin-top: 1rem; }}
</style>
</head>
<body>
<h1>roji &mdash; registered routes</h1>
<table>
<tr><th>URL</th><th>Target</th><th>Service</th><th>Container</th></tr>
{rows}
</table>
<p class="meta">{count} routes &middot; observer {observer}</p>
</body>
</html>
"#,
        rows = rows,
        count = entries.len(),
        observer = observer,
    )
}

/// Minimal HTML escaping for values interpolated into the page.
fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hostname: &str, path_prefix: &str) -> RouteEntry {
        RouteEntry {
            hostname: hostname.to_string(),
            path_prefix: path_prefix.to_string(),
            target: "10.0.0.5:80".to_string(),
            service_name: "web".to_string(),
            container_name: "myapp-web-1".to_string(),
            project_name: "myapp".to_string(),
        }
    }

    fn report(routes: usize) -> StatusReport {
        StatusReport {
            routes,
            observer_connected: true,
            certificate: None,
        }
    }

    #[test]
    fn test_routes_json_lists_entries() {
        let entries = vec![entry("web.localhost", "")];
        let response = respond(ROUTES_PATH, &entries, &report(1));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_health_json() {
        let response = respond(HEALTH_PATH, &[], &report(0));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_dashboard_html_contains_routes() {
        let entries = vec![entry("web.localhost", "/api")];
        let html = render_dashboard(&entries, &report(1));
        assert!(html.contains("web.localhost/api"));
        assert!(html.contains("10.0.0.5:80"));
        assert!(html.contains("observer connected"));
    }

    #[test]
    fn test_dashboard_html_empty_state() {
        let html = render_dashboard(&[], &report(0));
        assert!(html.contains("No routes registered"));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<svc>&\"x\""), "&lt;svc&gt;&amp;&quot;x&quot;");
    }
}
