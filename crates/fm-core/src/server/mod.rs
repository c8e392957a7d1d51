//! HTTP service: batch uploads, dashboard JSON and Prometheus metrics.
//!
//! A fixed pool of worker threads shares one `tiny_http::Server`. Each worker
//! owns its own [`Store`] connection, so no lock is taken around the
//! database; SQLite's WAL mode and busy timeout arbitrate between workers
//! (and between server processes pointed at the same file).
//!
//! Upload responses are always HTTP 200 with an [`IngestOutcome`] body. The
//! dashboard endpoints return 404 for unknown ids and 500 only when the store
//! itself fails.

pub mod metrics;
pub mod routes;

pub use metrics::IngestMetrics;
pub use routes::Route;

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fm_common::{IngestError, IngestOutcome, SessionId};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::FuzzermonConfig;
use crate::ingest::run_ingest;
use crate::logging::{event_names, Stage};
use crate::query::{self, OpcodeSort, SortDir};
use crate::session::{resolve_display_mode, MemorySessionStore, SessionStore};
use crate::store::{Store, StoreError};

use routes::{query_param, session_cookie, session_from_cookie, split_url};

/// How long a worker blocks waiting for a request before checking shutdown.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address: {0}")]
    Address(#[from] crate::config::ValidationError),

    #[error("failed to listen on {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },

    #[error("failed to open database {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Settings each worker needs per request.
#[derive(Debug, Clone)]
struct HandlerSettings {
    max_body_bytes: u64,
    session_cookie: String,
    metrics_path: Option<String>,
}

/// Per-worker state.
struct Worker {
    store: Store,
    sessions: Arc<dyn SessionStore>,
    metrics: Option<IngestMetrics>,
    settings: Arc<HandlerSettings>,
}

/// Handle to the running HTTP server.
pub struct Server {
    http: Arc<tiny_http::Server>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    addr: SocketAddr,
    metrics: Option<IngestMetrics>,
}

impl Server {
    /// Bind, open one connection per worker and start serving.
    pub fn start(config: &FuzzermonConfig) -> Result<Self, ServerError> {
        let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::default());
        Self::start_with_sessions(config, sessions)
    }

    pub fn start_with_sessions(
        config: &FuzzermonConfig,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, ServerError> {
        let addr = config.socket_addr()?;
        let metrics = if config.metrics.enabled {
            Some(IngestMetrics::new()?)
        } else {
            None
        };

        // Open every connection up front so a bad database fails startup.
        let stores = (0..config.server.workers)
            .map(|_| {
                Store::open(&config.storage.database, config.storage.busy_timeout()).map_err(
                    |source| ServerError::Store {
                        path: config.storage.database.clone(),
                        source,
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let http = tiny_http::Server::http(addr).map_err(|e| ServerError::Bind {
            addr,
            message: e.to_string(),
        })?;
        let addr = http.server_addr().to_ip().unwrap_or(addr);
        let http = Arc::new(http);

        let settings = Arc::new(HandlerSettings {
            max_body_bytes: config.server.max_body_bytes,
            session_cookie: config.server.session_cookie.clone(),
            metrics_path: config
                .metrics
                .enabled
                .then(|| config.metrics.path.clone()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(stores.len());
        for (index, store) in stores.into_iter().enumerate() {
            let mut worker = Worker {
                store,
                sessions: sessions.clone(),
                metrics: metrics.clone(),
                settings: settings.clone(),
            };
            let http = http.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("fm-worker-{}", index))
                .spawn(move || worker.serve(&http, &shutdown))
                .map_err(ServerError::Spawn)?;
            workers.push(handle);
        }

        info!(
            event = event_names::SERVER_STARTED,
            stage = %Stage::Serve,
            addr = %addr,
            workers = workers.len() as u64,
            database = %config.storage.database.display(),
            "fuzzermon listening"
        );

        Ok(Server {
            http,
            shutdown,
            workers,
            addr,
            metrics,
        })
    }

    /// Get the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics(&self) -> Option<&IngestMetrics> {
        self.metrics.as_ref()
    }

    /// A flag that stops the server when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Block until the shutdown flag is set and every worker has exited.
    pub fn wait(mut self) {
        self.join_workers();
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for _ in 0..self.workers.len() {
            self.http.unblock();
        }
        self.join_workers();
    }

    fn join_workers(&mut self) {
        let had_workers = !self.workers.is_empty();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        if had_workers {
            info!(event = event_names::SERVER_STOPPED, stage = %Stage::Serve, "fuzzermon stopped");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

/// A response before it is turned into a `tiny_http::Response`.
struct Reply {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Reply {
        match serde_json::to_string(value) {
            Ok(body) => Reply {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => {
                error!(error = %e, "failed to serialize response");
                Reply::error(500, "internal error")
            }
        }
    }

    fn error(status: u16, message: &str) -> Reply {
        Reply {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    fn text(status: u16, content_type: &'static str, body: String) -> Reply {
        Reply {
            status,
            content_type,
            body,
        }
    }
}

impl Worker {
    fn serve(&mut self, http: &tiny_http::Server, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Accept with timeout so we can check shutdown flag
            let request = match http.recv_timeout(RECV_TIMEOUT) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(e) => {
                    if !shutdown.load(Ordering::SeqCst) {
                        error!(error = %e, "accept error");
                    }
                    break;
                }
            };

            self.respond(request);
        }
    }

    fn respond(&mut self, mut request: tiny_http::Request) {
        let (path, query) = split_url(request.url());
        let (path, query) = (path.to_string(), query.to_string());
        let route = Route::parse(
            request.method(),
            &path,
            self.settings.metrics_path.as_deref(),
        );
        debug!(method = %request.method(), url = %request.url(), route = route.label(), "request");

        let mut set_cookie = None;
        let reply = match &route {
            Route::UploadBatch => self.upload(&mut request),
            Route::Archs => self.query_reply(|conn| query::arch_overview(conn).map(Some)),
            Route::Arch(id) => {
                let sort = OpcodeSort::parse_lenient(query_param(&query, "sort"));
                let dir = SortDir::parse_lenient(query_param(&query, "dir"));
                self.query_reply(|conn| query::arch_view(conn, *id, sort, dir))
            }
            Route::Opcode(id) => {
                let session = self.session(&request, &mut set_cookie);
                let mode = resolve_display_mode(
                    self.sessions.as_ref(),
                    &session,
                    query_param(&query, "numeric_display"),
                );
                self.query_reply(|conn| query::opcode_view(conn, *id, mode))
            }
            Route::Failure(id) => {
                let session = self.session(&request, &mut set_cookie);
                let mode = resolve_display_mode(
                    self.sessions.as_ref(),
                    &session,
                    query_param(&query, "numeric_display"),
                );
                self.query_reply(|conn| {
                    query::get_failure(conn, *id)
                        .map(|found| found.map(|detail| WithDisplay::new(detail, mode)))
                })
            }
            Route::SignalError(id) => {
                let session = self.session(&request, &mut set_cookie);
                let mode = resolve_display_mode(
                    self.sessions.as_ref(),
                    &session,
                    query_param(&query, "numeric_display"),
                );
                self.query_reply(|conn| {
                    query::get_signal_error(conn, *id)
                        .map(|found| found.map(|detail| WithDisplay::new(detail, mode)))
                })
            }
            Route::Health => Reply::json(200, &serde_json::json!({ "status": "ok" })),
            Route::Metrics => self.render_metrics(),
            Route::MethodNotAllowed { .. } => Reply::error(405, "method not allowed"),
            Route::NotFound => Reply::error(404, "not found"),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_request(route.label(), reply.status);
        }

        let mut response =
            tiny_http::Response::from_string(reply.body).with_status_code(reply.status);
        let mut headers = vec![header("Content-Type", reply.content_type)];
        if let Route::MethodNotAllowed { allowed } = route {
            headers.push(header("Allow", allowed));
        }
        if let Some(cookie) = &set_cookie {
            headers.push(header("Set-Cookie", cookie));
        }
        for h in headers.into_iter().flatten() {
            response.add_header(h);
        }
        if let Err(e) = request.respond(response) {
            warn!(error = %e, "failed to send response");
        }
    }

    fn upload(&mut self, request: &mut tiny_http::Request) -> Reply {
        let started = Instant::now();
        let limit = self.settings.max_body_bytes;

        let declared = request.body_length().map(|n| n as u64);
        let body = match declared {
            Some(n) if n > limit => None,
            _ => {
                let mut body = Vec::new();
                match request
                    .as_reader()
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut body)
                {
                    Ok(_) if body.len() as u64 > limit => None,
                    Ok(_) => Some(body),
                    Err(e) => {
                        warn!(
                            event = event_names::REQUEST_FAILED,
                            stage = %Stage::Received,
                            error = %e,
                            "failed to read upload body"
                        );
                        let err = IngestError::MalformedDocument("request body could not be read".into());
                        return self.rejected_before_ingest(&err);
                    }
                }
            }
        };

        let Some(body) = body else {
            let err = IngestError::invalid_value(
                "body",
                format!("request body exceeds {} bytes", limit),
            );
            warn!(
                event = event_names::INGEST_FAILED,
                stage = %Stage::Received,
                limit,
                "upload rejected: body too large"
            );
            return self.rejected_before_ingest(&err);
        };

        let outcome = match run_ingest(&mut self.store, &body) {
            Ok(report) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_committed(&report, started.elapsed().as_secs_f64());
                }
                IngestOutcome::Success
            }
            Err(failure) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejected(&failure, started.elapsed().as_secs_f64());
                }
                failure.outcome()
            }
        };
        Reply::json(200, &outcome)
    }

    fn rejected_before_ingest(&self, err: &IngestError) -> Reply {
        if let Some(metrics) = &self.metrics {
            metrics.record_rejected_category(err.failure_category().as_str());
        }
        Reply::json(200, &IngestOutcome::from(err))
    }

    fn query_reply<T, F>(&self, run: F) -> Reply
    where
        T: Serialize,
        F: FnOnce(&rusqlite::Connection) -> crate::store::Result<Option<T>>,
    {
        match run(self.store.connection()) {
            Ok(Some(value)) => Reply::json(200, &value),
            Ok(None) => Reply::error(404, "not found"),
            Err(e) => {
                warn!(
                    event = event_names::REQUEST_FAILED,
                    stage = %Stage::Query,
                    error = %e,
                    "dashboard query failed"
                );
                Reply::error(500, "query failed")
            }
        }
    }

    fn render_metrics(&self) -> Reply {
        let Some(metrics) = &self.metrics else {
            return Reply::error(404, "not found");
        };
        match metrics.render() {
            Ok(body) => Reply::text(200, "text/plain; version=0.0.4; charset=utf-8", body),
            Err(e) => {
                error!(error = %e, "failed to render metrics");
                Reply::error(500, "failed to render metrics")
            }
        }
    }

    /// The request's session, minting one (and a cookie) when absent.
    fn session(&self, request: &tiny_http::Request, set_cookie: &mut Option<String>) -> SessionId {
        let cookie_header = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Cookie"))
            .map(|h| h.value.as_str());
        match session_from_cookie(cookie_header, &self.settings.session_cookie) {
            Some(session) => session,
            None => {
                let session = SessionId::new();
                *set_cookie = Some(session_cookie(&self.settings.session_cookie, &session));
                session
            }
        }
    }
}

/// A detail page together with the session's display mode.
#[derive(Serialize)]
struct WithDisplay<T> {
    #[serde(flatten)]
    detail: T,
    numeric_display: fm_common::DisplayMode,
}

impl<T> WithDisplay<T> {
    fn new(detail: T, numeric_display: fm_common::DisplayMode) -> Self {
        WithDisplay {
            detail,
            numeric_display,
        }
    }
}

fn header(name: &str, value: &str) -> Option<tiny_http::Header> {
    tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}
