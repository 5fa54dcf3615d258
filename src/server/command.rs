//! Deploy command preparation for native and container modes.
//!
//! Native mode hands the command string to a shell with the config directory
//! as cwd. Container mode composes an SSH invocation to the host: the remote
//! command ensures the upload path exists, changes into the host-side config
//! directory (or the script's own directory for script-path commands) and
//! runs the command there. Relative arguments resolve identically in both
//! modes because the working directory is always the config directory.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::paths::{PathContext, SSH_KEY_PATH};

/// A fully prepared subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl PreparedCommand {
    /// Build a `tokio::process::Command` from the prepared parts.
    pub fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

/// Prepare the deploy command for an environment.
pub fn prepare_deploy_command(
    deploy_command: &str,
    upload_path: &Path,
    ctx: &PathContext,
) -> PreparedCommand {
    match &ctx.container {
        None => PreparedCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), deploy_command.to_string()],
            cwd: Some(ctx.config_dir.clone()),
        },
        Some(container) => {
            let remote = remote_command(
                deploy_command,
                upload_path,
                &container.host_config_dir,
            );
            let mut args = vec![
                "-i".to_string(),
                SSH_KEY_PATH.to_string(),
                "-p".to_string(),
                container.ssh.port.to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ];
            args.push(format!("{}@{}", container.ssh.user, container.ssh.host));
            args.push(remote);
            PreparedCommand {
                program: "ssh".to_string(),
                args,
                cwd: None,
            }
        }
    }
}

/// Compose the host-side shell line for container mode.
fn remote_command(deploy_command: &str, upload_path: &Path, host_config_dir: &Path) -> String {
    let upload = sh_quote(&upload_path.to_string_lossy());

    if let Some((script, rest)) = detect_script(deploy_command) {
        let script_path = if Path::new(&script).is_absolute() {
            PathBuf::from(&script)
        } else {
            host_config_dir.join(&script)
        };
        let dir = script_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| host_config_dir.to_path_buf());
        let name = script_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(script);
        let mut line = format!(
            "mkdir -p {} && cd {} && ./{}",
            upload,
            sh_quote(&dir.to_string_lossy()),
            name
        );
        if !rest.is_empty() {
            line.push(' ');
            line.push_str(&rest);
        }
        line
    } else {
        format!(
            "mkdir -p {} && cd {} && {}",
            upload,
            sh_quote(&host_config_dir.to_string_lossy()),
            deploy_command
        )
    }
}

/// A command is a script path when its first token starts with `./`, `../`
/// or is absolute. Returns the script token and the remaining argument text.
fn detect_script(command: &str) -> Option<(String, String)> {
    let trimmed = command.trim();
    let (first, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim_start()),
        None => (trimmed, ""),
    };
    if first.starts_with("./") || first.starts_with("../") || first.starts_with('/') {
        Some((first.to_string(), rest.to_string()))
    } else {
        None
    }
}

/// Single-quote a string for a POSIX shell.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::SshTarget;

    fn container_ctx() -> PathContext {
        PathContext::containerised(
            PathBuf::from("/app/config"),
            PathBuf::from("/home/deploy/project"),
            SshTarget {
                host: "host.internal".to_string(),
                user: "deploy".to_string(),
                port: 2202,
            },
        )
    }

    #[test]
    fn test_native_mode_runs_shell_in_config_dir() {
        let ctx = PathContext::native(PathBuf::from("/etc/fde"));
        let prepared =
            prepare_deploy_command("systemctl restart app", Path::new("/srv/app"), &ctx);

        assert_eq!(prepared.program, "sh");
        assert_eq!(
            prepared.args,
            vec!["-c".to_string(), "systemctl restart app".to_string()]
        );
        assert_eq!(prepared.cwd.as_deref(), Some(Path::new("/etc/fde")));
    }

    #[test]
    fn test_container_mode_wraps_with_ssh() {
        let prepared = prepare_deploy_command(
            "systemctl restart app",
            Path::new("/srv/app"),
            &container_ctx(),
        );

        assert_eq!(prepared.program, "ssh");
        assert_eq!(prepared.cwd, None);
        assert!(prepared.args.contains(&"deploy@host.internal".to_string()));
        assert!(prepared.args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(prepared.args.contains(&"IdentitiesOnly=yes".to_string()));
        assert!(prepared.args.contains(&"2202".to_string()));

        let remote = prepared.args.last().unwrap();
        assert_eq!(
            remote,
            "mkdir -p '/srv/app' && cd '/home/deploy/project' && systemctl restart app"
        );
    }

    #[test]
    fn test_container_mode_script_path_runs_from_script_dir() {
        let prepared = prepare_deploy_command(
            "./scripts/deploy.sh ./dist",
            Path::new("/srv/app"),
            &container_ctx(),
        );

        let remote = prepared.args.last().unwrap();
        assert_eq!(
            remote,
            "mkdir -p '/srv/app' && cd '/home/deploy/project/scripts' && ./deploy.sh ./dist"
        );
    }

    #[test]
    fn test_container_mode_absolute_script() {
        let prepared = prepare_deploy_command(
            "/opt/deploy/run.sh",
            Path::new("/srv/app"),
            &container_ctx(),
        );

        let remote = prepared.args.last().unwrap();
        assert_eq!(
            remote,
            "mkdir -p '/srv/app' && cd '/opt/deploy' && ./run.sh"
        );
    }

    #[test]
    fn test_sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }
}
