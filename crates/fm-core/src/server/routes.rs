//! Request routing, query strings and the session cookie.

use fm_common::{ArchId, FailureId, OpcodeId, SessionId, SignalErrorId};
use tiny_http::Method;

/// Everything the server answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    UploadBatch,
    Archs,
    Arch(ArchId),
    Opcode(OpcodeId),
    Failure(FailureId),
    SignalError(SignalErrorId),
    Health,
    Metrics,
    MethodNotAllowed { allowed: &'static str },
    NotFound,
}

impl Route {
    /// Match a request line. `metrics_path` is `None` when metrics are off.
    pub fn parse(method: &Method, path: &str, metrics_path: Option<&str>) -> Route {
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };

        let route = match path {
            "/upload_batch" => Route::UploadBatch,
            "/health" => Route::Health,
            "/api/archs" => Route::Archs,
            p if Some(p) == metrics_path => Route::Metrics,
            p => match id_route(p) {
                Some(route) => route,
                None => return Route::NotFound,
            },
        };

        let allowed = match route {
            Route::UploadBatch => "POST",
            _ => "GET",
        };
        let ok = match route {
            Route::UploadBatch => *method == Method::Post,
            _ => *method == Method::Get || *method == Method::Head,
        };
        if ok {
            route
        } else {
            Route::MethodNotAllowed { allowed }
        }
    }

    /// Low-cardinality label for request metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Route::UploadBatch => "upload_batch",
            Route::Archs => "archs",
            Route::Arch(_) => "arch",
            Route::Opcode(_) => "opcode",
            Route::Failure(_) => "failure",
            Route::SignalError(_) => "signal_error",
            Route::Health => "health",
            Route::Metrics => "metrics",
            Route::MethodNotAllowed { .. } => "method_not_allowed",
            Route::NotFound => "not_found",
        }
    }
}

fn id_route(path: &str) -> Option<Route> {
    let rest = path.strip_prefix("/api/")?;
    let (collection, id) = rest.split_once('/')?;
    if id.contains('/') {
        return None;
    }
    match collection {
        "archs" => id.parse().ok().map(Route::Arch),
        "opcodes" => id.parse().ok().map(Route::Opcode),
        "failures" => id.parse().ok().map(Route::Failure),
        "signal_errors" => id.parse().ok().map(Route::SignalError),
        _ => None,
    }
}

/// Split a request URL into path and query string.
pub fn split_url(url: &str) -> (&str, &str) {
    url.split_once('?').unwrap_or((url, ""))
}

/// First value of `key` in a query string.
///
/// Values the dashboards accept are plain ASCII tokens, so no percent
/// decoding is done; an encoded value simply fails to match and callers fall
/// back to their defaults.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// Session id from a `Cookie` header, if present and well formed.
pub fn session_from_cookie(header: Option<&str>, cookie_name: &str) -> Option<SessionId> {
    header?
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .and_then(|(_, value)| SessionId::parse(value.trim()))
}

/// `Set-Cookie` value for a new session.
pub fn session_cookie(cookie_name: &str, session: &SessionId) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        cookie_name,
        session.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_routes() {
        assert_eq!(Route::parse(&Method::Post, "/upload_batch", None), Route::UploadBatch);
        assert_eq!(Route::parse(&Method::Post, "/upload_batch/", None), Route::UploadBatch);
        assert_eq!(Route::parse(&Method::Get, "/api/archs", None), Route::Archs);
        assert_eq!(Route::parse(&Method::Get, "/health", None), Route::Health);
        assert_eq!(Route::parse(&Method::Get, "/", None), Route::NotFound);
    }

    #[test]
    fn id_routes() {
        assert_eq!(
            Route::parse(&Method::Get, "/api/archs/3", None),
            Route::Arch(ArchId(3))
        );
        assert_eq!(
            Route::parse(&Method::Get, "/api/opcodes/12", None),
            Route::Opcode(OpcodeId(12))
        );
        assert_eq!(
            Route::parse(&Method::Get, "/api/failures/1", None),
            Route::Failure(FailureId(1))
        );
        assert_eq!(
            Route::parse(&Method::Get, "/api/signal_errors/9", None),
            Route::SignalError(SignalErrorId(9))
        );
        assert_eq!(Route::parse(&Method::Get, "/api/archs/x", None), Route::NotFound);
        assert_eq!(Route::parse(&Method::Get, "/api/archs/1/2", None), Route::NotFound);
        assert_eq!(Route::parse(&Method::Get, "/api/hosts/1", None), Route::NotFound);
    }

    #[test]
    fn methods_are_checked() {
        assert_eq!(
            Route::parse(&Method::Get, "/upload_batch", None),
            Route::MethodNotAllowed { allowed: "POST" }
        );
        assert_eq!(
            Route::parse(&Method::Post, "/api/archs", None),
            Route::MethodNotAllowed { allowed: "GET" }
        );
    }

    #[test]
    fn metrics_route_only_when_enabled() {
        assert_eq!(
            Route::parse(&Method::Get, "/metrics", Some("/metrics")),
            Route::Metrics
        );
        assert_eq!(Route::parse(&Method::Get, "/metrics", None), Route::NotFound);
    }

    #[test]
    fn query_params() {
        let (path, query) = split_url("/api/archs/1?sort=num_failures&dir=desc&flag");
        assert_eq!(path, "/api/archs/1");
        assert_eq!(query_param(query, "sort"), Some("num_failures"));
        assert_eq!(query_param(query, "dir"), Some("desc"));
        assert_eq!(query_param(query, "flag"), None);
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(split_url("/health"), ("/health", ""));
    }

    #[test]
    fn session_cookie_roundtrip() {
        let session = SessionId::new();
        let set = session_cookie("fm_session", &session);
        let value = set.split(';').next().unwrap();
        let header = format!("theme=dark; {}", value);
        assert_eq!(session_from_cookie(Some(&header), "fm_session"), Some(session));
        assert_eq!(session_from_cookie(Some("fm_session=forged"), "fm_session"), None);
        assert_eq!(session_from_cookie(None, "fm_session"), None);
    }
}
