//! Path and command-context resolution.
//!
//! A resolved [`PathContext`] is pure data: where the config file lives, and
//! (in container mode) the host-side view of that directory plus the SSH
//! target used to proxy command execution to the host. Data paths and the
//! command working directory resolve through different anchors in container
//! mode: on-disk data lives under the container anchor, while commands run in
//! the host-side config directory.

use std::path::{Path, PathBuf};

use crate::errors::FdeError;

/// Anchor for relative data paths when running inside a container.
pub const CONTAINER_ANCHOR: &str = "/app";

/// Fixed location of the SSH private key inside the container.
pub const SSH_KEY_PATH: &str = "/root/.ssh/fde_host_key";

/// Host-side config directory (mandatory in container mode).
pub const HOST_CONFIG_DIR_VAR: &str = "FDE_HOST_CONFIG_DIR";

pub const SSH_HOST_VAR: &str = "FDE_SSH_HOST";
pub const SSH_USER_VAR: &str = "FDE_SSH_USER";
pub const SSH_PORT_VAR: &str = "FDE_SSH_PORT";

/// Force container mode without marker files (useful under test).
pub const CONTAINER_FLAG_VAR: &str = "FDE_CONTAINER";

/// SSH endpoint on the host that executes deploy commands for a
/// containerised server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

/// Container-mode context: the host-side config directory and SSH target.
#[derive(Debug, Clone)]
pub struct ContainerEnv {
    pub host_config_dir: PathBuf,
    pub ssh: SshTarget,
}

/// Resolution context carried by every resolved configuration.
#[derive(Debug, Clone)]
pub struct PathContext {
    /// Directory containing the config file (container-side path when
    /// containerised).
    pub config_dir: PathBuf,

    /// Present when the server proxies command execution to a host.
    pub container: Option<ContainerEnv>,
}

impl PathContext {
    /// Native-mode context.
    pub fn native(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            container: None,
        }
    }

    /// Container-mode context from explicit parts.
    pub fn containerised(config_dir: PathBuf, host_config_dir: PathBuf, ssh: SshTarget) -> Self {
        Self {
            config_dir,
            container: Some(ContainerEnv {
                host_config_dir,
                ssh,
            }),
        }
    }

    /// Build a context from the process environment, detecting container
    /// mode from well-known markers. In container mode the host config
    /// directory variable is mandatory.
    pub fn detect(config_dir: PathBuf) -> Result<Self, FdeError> {
        if !is_container() {
            return Ok(Self::native(config_dir));
        }

        let host_config_dir = std::env::var(HOST_CONFIG_DIR_VAR).map_err(|_| {
            FdeError::Config(format!(
                "container mode requires {} to point at the host-side config directory",
                HOST_CONFIG_DIR_VAR
            ))
        })?;

        let host = std::env::var(SSH_HOST_VAR)
            .map_err(|_| FdeError::Config(format!("container mode requires {}", SSH_HOST_VAR)))?;
        let user = std::env::var(SSH_USER_VAR)
            .map_err(|_| FdeError::Config(format!("container mode requires {}", SSH_USER_VAR)))?;
        let port = match std::env::var(SSH_PORT_VAR) {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| FdeError::Config(format!("invalid {}: {}", SSH_PORT_VAR, raw)))?,
            Err(_) => 22,
        };

        Ok(Self::containerised(
            config_dir,
            PathBuf::from(host_config_dir),
            SshTarget { host, user, port },
        ))
    }

    /// Resolve a data path from config: absolute paths pass through; relative
    /// paths anchor at `/app` in container mode, else at the config dir.
    pub fn resolve_data_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match &self.container {
            Some(_) => Path::new(CONTAINER_ANCHOR).join(p),
            None => self.config_dir.join(p),
        }
    }

    /// Working directory for deploy command execution: the config directory,
    /// host-side when containerised. The command string is never rewritten.
    pub fn command_cwd(&self) -> &Path {
        match &self.container {
            Some(env) => &env.host_config_dir,
            None => &self.config_dir,
        }
    }
}

/// Whether the process runs inside a container that must proxy command
/// execution to a host.
pub fn is_container() -> bool {
    if matches!(std::env::var(CONTAINER_FLAG_VAR).as_deref(), Ok("1") | Ok("true")) {
        return true;
    }
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_ctx() -> PathContext {
        PathContext::containerised(
            PathBuf::from("/app/config"),
            PathBuf::from("/home/deploy/project"),
            SshTarget {
                host: "host.internal".to_string(),
                user: "deploy".to_string(),
                port: 22,
            },
        )
    }

    #[test]
    fn test_absolute_data_path_passes_through() {
        let ctx = PathContext::native(PathBuf::from("/etc/fde"));
        assert_eq!(
            ctx.resolve_data_path("/srv/app"),
            PathBuf::from("/srv/app")
        );
        assert_eq!(
            container_ctx().resolve_data_path("/srv/app"),
            PathBuf::from("/srv/app")
        );
    }

    #[test]
    fn test_relative_data_path_native_anchors_at_config_dir() {
        let ctx = PathContext::native(PathBuf::from("/etc/fde"));
        assert_eq!(
            ctx.resolve_data_path("uploads/web"),
            PathBuf::from("/etc/fde/uploads/web")
        );
    }

    #[test]
    fn test_relative_data_path_container_anchors_at_app() {
        assert_eq!(
            container_ctx().resolve_data_path("uploads/web"),
            PathBuf::from("/app/uploads/web")
        );
    }

    #[test]
    fn test_command_cwd_is_host_side_in_container_mode() {
        let native = PathContext::native(PathBuf::from("/etc/fde"));
        assert_eq!(native.command_cwd(), Path::new("/etc/fde"));

        // Commands run through the SSH wrapper see the host filesystem, so
        // the cwd must be the host-side config dir even though data paths
        // resolved against /app above.
        assert_eq!(
            container_ctx().command_cwd(),
            Path::new("/home/deploy/project")
        );
    }
}
