//! HTTP surface.
//!
//! One accept loop polls `recv_timeout` so it can observe the shutdown flag;
//! every accepted request is handled on its own thread. Routing is a pure
//! function over the [`Daemon`] so it can be exercised without sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use sparcus_common::{Error, OutputFormat, RequestPath, StructuredError};
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

use crate::daemon::Daemon;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const ACCEPT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("failed to spawn accept thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A response ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn ok(content_type: &'static str, body: impl Into<String>) -> Self {
        Reply {
            status: 200,
            content_type,
            body: body.into(),
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        Reply {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Reply::ok("application/json", body),
            Err(e) => Reply::text(500, format!("Error encoding JSON: {e}")),
        }
    }

    fn not_found() -> Self {
        Reply::text(404, "Page not found")
    }
}

/// Split and percent-decode a query string. `+` decodes to a space; the
/// first occurrence of a name wins.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let (Some(name), Some(value)) = (decode_component(name), decode_component(value)) else {
            continue;
        };
        params.entry(name).or_insert(value);
    }
    params
}

fn decode_component(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|s| s.into_owned())
}

/// Route one request URL (path plus optional query) to a reply.
pub fn route(daemon: &Daemon, url: &str) -> Reply {
    let (raw_path, query) = url.split_once('?').unwrap_or((url, ""));
    let Ok(path) = urlencoding::decode(raw_path) else {
        return Reply::text(400, "malformed request path");
    };
    let params = parse_query(query);

    if let Some(rest) = path.strip_prefix("/set/") {
        return handle_set(daemon, rest, params.get("value").map(String::as_str));
    }
    if let Some(rest) = path.strip_prefix("/get/") {
        return handle_get(
            daemon,
            rest,
            params.get("average").map(String::as_str),
            OutputFormat::from_query(params.get("format").map(String::as_str)),
        );
    }

    match &*path {
        "/" | "/index.html" => Reply::ok(
            "text/html; charset=utf-8",
            INDEX_HTML.replace("{{VERSION}}", env!("CARGO_PKG_VERSION")),
        ),
        "/ajax/status" => Reply::json(&daemon.store().snapshot()),
        "/ajax/events" => Reply::json(&daemon.events().all()),
        "/ajax/handlers" => Reply::json(&daemon.describe_handlers()),
        "/ajax/config" => Reply::json(&daemon.config().redacted()),
        "/health" | "/healthz" => Reply::text(200, "ok"),
        "/metrics" => match daemon.metrics().render() {
            Ok(body) => Reply::ok(METRICS_CONTENT_TYPE, body),
            Err(e) => {
                error!(error = %e, "failed to render metrics");
                Reply::text(500, format!("error: {e}"))
            }
        },
        _ => Reply::not_found(),
    }
}

fn handle_set(daemon: &Daemon, raw_path: &str, value: Option<&str>) -> Reply {
    match RequestPath::parse(raw_path) {
        Ok(path) => Reply::text(200, daemon.set(&path, value).confirmation()),
        Err(e) => e.into(),
    }
}

/// Every caller error on a read is reported as 404, including a
/// non-numeric `average`. JSON readers get a structured error body.
fn handle_get(daemon: &Daemon, raw_path: &str, average: Option<&str>, format: OutputFormat) -> Reply {
    let result = RequestPath::parse(raw_path).and_then(|path| daemon.get(&path, average));
    let e = match result {
        Ok((value, timestamp)) => {
            return Reply::ok(format.content_type(), format.render(&value, timestamp.timestamp()))
        }
        Err(e) => e,
    };

    match format {
        OutputFormat::Json => Reply {
            status: 404,
            content_type: "application/json",
            body: StructuredError::from(&e)
                .with_context("average", average)
                .to_json(),
        },
        _ => Reply::text(404, e.to_string()),
    }
}

fn respond(request: tiny_http::Request, reply: Reply) {
    let mut response = tiny_http::Response::from_string(reply.body).with_status_code(reply.status);
    match format!("Content-Type: {}", reply.content_type).parse::<tiny_http::Header>() {
        Ok(header) => response = response.with_header(header),
        Err(()) => warn!(content_type = reply.content_type, "invalid content type header"),
    }
    if let Err(e) = request.respond(response) {
        debug!(error = %e, "failed to send response");
    }
}

/// Handle to the running listener.
pub struct HttpServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl HttpServer {
    /// Bind `addr` and start accepting on a background thread.
    pub fn start(addr: &str, daemon: Arc<Daemon>) -> Result<Self, ServerError> {
        let server = tiny_http::Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        let bound = server.server_addr().to_ip().ok_or_else(|| ServerError::Bind {
            addr: addr.to_string(),
            message: "listener has no IP address".to_string(),
        })?;

        info!(addr = %bound, "http server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let thread = thread::Builder::new()
            .name("sparcus-http".to_string())
            .spawn(move || accept_loop(server, daemon, &shutdown_clone))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            addr: bound,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for the accept loop to exit. Requests
    /// already handed to worker threads run to completion.
    pub fn shutdown(mut self) {
        self.stop();
        info!("http server stopped");
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(server: tiny_http::Server, daemon: Arc<Daemon>, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let request = match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(req)) => req,
            Ok(None) => continue,
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!(error = %e, "http accept error");
                }
                break;
            }
        };

        if shutdown.load(Ordering::SeqCst) {
            let _ = request
                .respond(tiny_http::Response::from_string("shutting down").with_status_code(503));
            break;
        }

        let daemon = daemon.clone();
        let spawned = thread::Builder::new()
            .name("sparcus-request".to_string())
            .spawn(move || {
                let url = request.url().to_string();
                debug!(method = %request.method(), url = %url, "http request");
                let reply = route(&daemon, &url);
                respond(request, reply);
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn request thread");
        }
    }
}

impl From<Error> for Reply {
    fn from(e: Error) -> Self {
        Reply::text(e.http_status(), e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
