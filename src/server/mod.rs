//! HTTP server: dispatcher, auth, chunk staging, deploy execution.

pub mod auth;
pub mod chunks;
pub mod command;
pub mod deploy;
pub mod error;
pub mod handlers;
pub mod serve;
pub mod state;
pub mod upload;

use axum::http::HeaderMap;

/// Read a header as a string, if present and valid UTF-8.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
