//! Request validation: environment lookup and shared-secret check.
//!
//! Single entry point used by every protected handler. The returned error
//! string drives the status code at the boundary: messages containing
//! "token" map to 403, everything else to 400 (see `server::error`).

use crate::config::{Config, ResolvedEnv};
use crate::utils::constant_time_eq;

/// Validate `(env, authorization)` against the resolved configuration.
///
/// Checks run in a fixed order: env presence, env existence, configured
/// secret, header presence, then a constant-time token comparison.
pub fn validate_request<'a>(
    env: Option<&str>,
    auth_token: Option<&str>,
    config: &'a Config,
) -> Result<&'a ResolvedEnv, String> {
    let env = match env {
        Some(name) if !name.is_empty() => name,
        _ => return Err("missing env parameter".to_string()),
    };

    let env_config = config
        .env(env)
        .ok_or_else(|| format!("unknown environment '{}'", env))?;

    let expected = match env_config.token.as_deref() {
        Some(token) => token,
        None => return Err("no deploy secret configured for environment".to_string()),
    };

    let provided = match auth_token {
        Some(token) if !token.is_empty() => token,
        _ => return Err("missing authorization token".to_string()),
    };

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err("invalid token".to_string());
    }

    Ok(env_config)
}
