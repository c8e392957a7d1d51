//! Semantic validation for configuration files.
//!
//! Serde catches wrong shapes and types; this module catches values that
//! parse but cannot work (port 0, no workers, a metrics path shadowing an
//! API route).

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use super::FuzzermonConfig;

/// Upper bound on request workers.
pub const MAX_WORKERS: usize = 256;

/// Paths the server already routes; the metrics endpoint may not take them.
const RESERVED_PATHS: [&str; 3] = ["/upload_batch", "/health", "/api"];

/// Errors that can occur during semantic validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("server.bind '{value}' is not an IP address")]
    BindAddress { value: String },

    #[error("server.port must be non-zero")]
    PortZero,

    #[error("server.workers must be in 1..={max} (got {value})")]
    WorkersRange { value: usize, max: usize },

    #[error("server.max_body_bytes must be non-zero")]
    BodyLimitZero,

    #[error("server.session_cookie '{value}' is not a valid cookie name")]
    CookieName { value: String },

    #[error("storage.busy_timeout_ms must be non-zero")]
    BusyTimeoutZero,

    #[error("storage.database must not be empty")]
    DatabasePathEmpty,

    #[error("metrics.path '{value}' must start with '/' and not shadow {reserved}")]
    MetricsPath { value: String, reserved: String },
}

pub(crate) fn parse_socket_addr(bind: &str, port: u16) -> Result<SocketAddr, ValidationError> {
    bind.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| ValidationError::BindAddress {
            value: bind.to_string(),
        })
}

fn is_cookie_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// Validate a fully loaded configuration.
pub fn validate_config(config: &FuzzermonConfig) -> Result<(), ValidationError> {
    let server = &config.server;
    parse_socket_addr(&server.bind, server.port)?;
    if server.port == 0 {
        return Err(ValidationError::PortZero);
    }
    if server.workers == 0 || server.workers > MAX_WORKERS {
        return Err(ValidationError::WorkersRange {
            value: server.workers,
            max: MAX_WORKERS,
        });
    }
    if server.max_body_bytes == 0 {
        return Err(ValidationError::BodyLimitZero);
    }
    if !is_cookie_token(&server.session_cookie) {
        return Err(ValidationError::CookieName {
            value: server.session_cookie.clone(),
        });
    }

    if config.storage.busy_timeout_ms == 0 {
        return Err(ValidationError::BusyTimeoutZero);
    }
    if config.storage.database.as_os_str().is_empty() {
        return Err(ValidationError::DatabasePathEmpty);
    }

    let path = &config.metrics.path;
    let shadows = |reserved: &str| path == reserved || path.starts_with(&format!("{}/", reserved));
    if config.metrics.enabled
        && (!path.starts_with('/') || path == "/" || RESERVED_PATHS.iter().any(|r| shadows(r)))
    {
        return Err(ValidationError::MetricsPath {
            value: path.clone(),
            reserved: RESERVED_PATHS.join(", "),
        });
    }

    Ok(())
}
