//! Configuration loading and the resolved environment model.
//!
//! The YAML file uses camelCase keys. Tokens and server URLs fall back from
//! the environment level to the top level; every path field is absolute after
//! resolution. The client requires an effective serverUrl + token + localPath
//! for the environment it uses; the server keeps tokens optional so the
//! request validator can answer with a 400 instead of refusing to boot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::FdeError;
use crate::logs::LogLevel;
use crate::paths::PathContext;

/// Config file names probed in the working directory.
pub const CONFIG_FILE_NAMES: &[&str] = &["fde.yml", "fde.yaml"];

/// Raw YAML shape, prior to resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub server_url: Option<String>,
    pub token: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub server: ServerSection,
    pub environments: HashMap<String, RawEnv>,
}

/// Server bind options.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Raw per-environment entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnv {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub local_path: Option<String>,
    pub upload_path: Option<String>,
    pub deploy_command: Option<String>,
    pub build_command: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Resolved environment: fallbacks applied, paths absolute.
#[derive(Debug, Clone)]
pub struct ResolvedEnv {
    pub name: String,
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub local_path: Option<PathBuf>,
    pub upload_path: Option<PathBuf>,
    pub deploy_command: Option<String>,
    pub build_command: Option<String>,
    pub exclude: Vec<String>,
}

/// Client-side view of an environment; all required fields present.
#[derive(Debug, Clone, Copy)]
pub struct ClientEnv<'a> {
    pub name: &'a str,
    pub server_url: &'a str,
    pub token: &'a str,
    pub local_path: &'a Path,
    pub build_command: Option<&'a str>,
    pub exclude: &'a [String],
}

/// Server-side view of an environment.
#[derive(Debug, Clone, Copy)]
pub struct ServerEnv<'a> {
    pub name: &'a str,
    pub upload_path: &'a Path,
    pub deploy_command: &'a str,
}

impl ResolvedEnv {
    /// Require the client-side fields. Missing token or serverUrl is a fatal
    /// configuration error for client usage.
    pub fn client_view(&self) -> Result<ClientEnv<'_>, FdeError> {
        let server_url = self.server_url.as_deref().ok_or_else(|| {
            FdeError::Config(format!(
                "environment '{}' has no serverUrl (set it on the environment or at the top level)",
                self.name
            ))
        })?;
        let token = self.token.as_deref().ok_or_else(|| {
            FdeError::Config(format!(
                "environment '{}' has no token (set it on the environment or at the top level)",
                self.name
            ))
        })?;
        let local_path = self.local_path.as_deref().ok_or_else(|| {
            FdeError::Config(format!("environment '{}' has no localPath", self.name))
        })?;
        Ok(ClientEnv {
            name: &self.name,
            server_url,
            token,
            local_path,
            build_command: self.build_command.as_deref(),
            exclude: &self.exclude,
        })
    }

    /// Require the server-side fields used by upload placement and deploys.
    pub fn server_view(&self) -> Result<ServerEnv<'_>, FdeError> {
        let upload_path = self.upload_path.as_deref().ok_or_else(|| {
            FdeError::Config(format!("environment '{}' has no uploadPath", self.name))
        })?;
        let deploy_command = self.deploy_command.as_deref().ok_or_else(|| {
            FdeError::Config(format!("environment '{}' has no deployCommand", self.name))
        })?;
        Ok(ServerEnv {
            name: &self.name,
            upload_path,
            deploy_command,
        })
    }
}

/// Fully loaded and resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ctx: PathContext,
    pub server: ServerSection,
    pub log_level: LogLevel,
    pub environments: HashMap<String, ResolvedEnv>,
}

impl Config {
    /// Load the config file (explicit path, else `fde.yml` / `fde.yaml` in
    /// the working directory), detect container mode, and resolve.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, FdeError> {
        let file = find_config_file(explicit)?;
        let text = tokio::fs::read_to_string(&file).await?;
        let raw: RawConfig = serde_yaml::from_str(&text)?;

        let parent = file.parent().unwrap_or_else(|| Path::new("."));
        let config_dir = tokio::fs::canonicalize(parent).await?;
        let ctx = PathContext::detect(config_dir)?;

        Ok(Self::resolve(raw, ctx))
    }

    /// Apply fallbacks and absolutize paths against an explicit context.
    pub fn resolve(raw: RawConfig, ctx: PathContext) -> Self {
        let environments = raw
            .environments
            .into_iter()
            .map(|(name, env)| {
                let resolved = ResolvedEnv {
                    server_url: env.server_url.or_else(|| raw.server_url.clone()),
                    token: env.token.or_else(|| raw.token.clone()),
                    local_path: env
                        .local_path
                        .map(|p| absolutize(&ctx.config_dir, &p)),
                    upload_path: env.upload_path.map(|p| ctx.resolve_data_path(&p)),
                    deploy_command: env.deploy_command,
                    build_command: env.build_command,
                    exclude: env.exclude,
                    name: name.clone(),
                };
                (name, resolved)
            })
            .collect();

        Self {
            ctx,
            server: raw.server,
            log_level: raw.log_level,
            environments,
        }
    }

    /// Look up an environment by name.
    pub fn env(&self, name: &str) -> Option<&ResolvedEnv> {
        self.environments.get(name)
    }
}

/// Client local paths always resolve against the config directory; the
/// container anchor only applies to server-side data paths.
fn absolutize(config_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_dir.join(p)
    }
}

fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, FdeError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(FdeError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    for name in CONFIG_FILE_NAMES {
        let candidate = PathBuf::from(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(FdeError::Config(
        "no fde.yml found in the working directory (use --config)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::SshTarget;

    const YAML: &str = r#"
serverUrl: http://deploy.internal:8080
token: top-secret
environments:
  prod:
    uploadPath: /srv/app
    deployCommand: ./scripts/deploy.sh
    localPath: ./dist
    exclude: ["*.map"]
  staging:
    serverUrl: http://staging.internal:8080
    token: staging-secret
    uploadPath: builds/staging
    deployCommand: systemctl restart app
"#;

    fn parse() -> RawConfig {
        serde_yaml::from_str(YAML).unwrap()
    }

    #[test]
    fn test_token_and_url_fallback() {
        let config = Config::resolve(parse(), PathContext::native(PathBuf::from("/etc/fde")));

        let prod = config.env("prod").unwrap();
        assert_eq!(prod.token.as_deref(), Some("top-secret"));
        assert_eq!(
            prod.server_url.as_deref(),
            Some("http://deploy.internal:8080")
        );

        let staging = config.env("staging").unwrap();
        assert_eq!(staging.token.as_deref(), Some("staging-secret"));
        assert_eq!(
            staging.server_url.as_deref(),
            Some("http://staging.internal:8080")
        );
    }

    #[test]
    fn test_paths_absolute_after_resolution() {
        let config = Config::resolve(parse(), PathContext::native(PathBuf::from("/etc/fde")));

        let prod = config.env("prod").unwrap();
        assert_eq!(prod.local_path.as_deref(), Some(Path::new("/etc/fde/dist")));
        assert_eq!(prod.upload_path.as_deref(), Some(Path::new("/srv/app")));

        let staging = config.env("staging").unwrap();
        assert_eq!(
            staging.upload_path.as_deref(),
            Some(Path::new("/etc/fde/builds/staging"))
        );
    }

    #[test]
    fn test_container_mode_upload_path_anchor() {
        let ctx = PathContext::containerised(
            PathBuf::from("/app/config"),
            PathBuf::from("/home/deploy/project"),
            SshTarget {
                host: "h".into(),
                user: "u".into(),
                port: 22,
            },
        );
        let config = Config::resolve(parse(), ctx);
        assert_eq!(
            config.env("staging").unwrap().upload_path.as_deref(),
            Some(Path::new("/app/builds/staging"))
        );
    }

    #[test]
    fn test_client_view_requires_token() {
        let mut raw = parse();
        raw.token = None;
        let config = Config::resolve(raw, PathContext::native(PathBuf::from("/etc/fde")));

        // prod inherited nothing; client usage must fail
        let err = config.env("prod").unwrap().client_view().unwrap_err();
        assert!(err.to_string().contains("no token"));

        // staging has its own token and survives
        assert!(config.env("staging").is_some());
        let mut staging = config.env("staging").unwrap().clone();
        staging.local_path = Some(PathBuf::from("/tmp/x"));
        assert!(staging.client_view().is_ok());
    }
}
