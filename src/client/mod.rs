//! Client-side operations: deploy, ping, health.

pub mod deploy;
pub mod http;
pub mod progress;
pub mod upload;

use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::archive::with_temp_archive;
use crate::client::http::ApiClient;
use crate::client::progress::Progress;
use crate::client::upload::{upload_file, UploadOptions};
use crate::config::Config;
use crate::errors::FdeError;

/// Package the environment's local path, push it, and trigger the deploy.
pub async fn run_deploy(config: &Config, env_name: &str, no_stream: bool) -> Result<(), FdeError> {
    let env = config
        .env(env_name)
        .ok_or_else(|| FdeError::Validation(format!("unknown environment '{}'", env_name)))?;
    let view = env.client_view()?;

    let client = ApiClient::new(view.server_url, view.token)?;
    // Fail fast on a bad token or unknown environment before any real work.
    client.verify(env_name).await?;

    if let Some(build) = view.build_command {
        run_build(build, &config.ctx.config_dir).await?;
    }

    let metadata = tokio::fs::metadata(view.local_path).await.map_err(|_| {
        FdeError::Config(format!(
            "localPath does not exist: {}",
            view.local_path.display()
        ))
    })?;

    let progress = Progress::new("upload");
    let options = UploadOptions::default();

    let outcome = if metadata.is_dir() {
        let client = &client;
        let options = &options;
        let progress = &progress;
        with_temp_archive(view.local_path, env_name, view.exclude, |zip_path| async move {
            upload_file(client, env_name, &zip_path, true, options, progress).await
        })
        .await?
    } else {
        upload_file(
            &client,
            env_name,
            view.local_path,
            false,
            &options,
            &progress,
        )
        .await?
    };

    info!(
        file = %outcome.file_name,
        size = outcome.file_size,
        extracted = outcome.extracted,
        "artifact uploaded to {}",
        outcome.upload_path
    );

    if no_stream {
        let report = client.deploy_sync(env_name).await?;
        if !report.stdout.is_empty() {
            print!("{}", report.stdout);
        }
        if !report.stderr.is_empty() {
            eprint!("{}", report.stderr);
        }
        if !report.success {
            return Err(FdeError::Deploy(format!(
                "deploy command failed (exit code {})",
                report.exit_code.unwrap_or(-1)
            )));
        }
        println!("deploy succeeded");
    } else {
        let report = deploy::stream_deploy(&client, env_name).await?;
        if !report.success {
            return Err(FdeError::Deploy(format!(
                "deploy command failed (exit code {})",
                report.exit_code.unwrap_or(-1)
            )));
        }
        println!("deploy succeeded");
    }

    Ok(())
}

/// Round-trip check against the environment's server.
pub async fn run_ping(config: &Config, env_name: &str) -> Result<(), FdeError> {
    let client = client_for(config, env_name)?;
    let started = Instant::now();
    let body = client.ping().await?;
    println!("{} ({} ms)", body.trim(), started.elapsed().as_millis());
    Ok(())
}

/// Print the server's health report.
pub async fn run_health(config: &Config, env_name: &str) -> Result<(), FdeError> {
    let client = client_for(config, env_name)?;
    let health = client.health().await?;
    println!(
        "status: {}\nversion: {}\nuptime: {}s\ntimestamp: {}",
        health["status"].as_str().unwrap_or("unknown"),
        health["version"].as_str().unwrap_or("unknown"),
        health["uptime"].as_u64().unwrap_or(0),
        health["timestamp"].as_str().unwrap_or("unknown"),
    );
    Ok(())
}

fn client_for(config: &Config, env_name: &str) -> Result<ApiClient, FdeError> {
    let env = config
        .env(env_name)
        .ok_or_else(|| FdeError::Validation(format!("unknown environment '{}'", env_name)))?;
    let view = env.client_view()?;
    ApiClient::new(view.server_url, view.token)
}

/// Run the optional build command in the config directory before packaging.
async fn run_build(command: &str, cwd: &Path) -> Result<(), FdeError> {
    info!("running build command: {}", command);
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .status()
        .await
        .map_err(|e| FdeError::Deploy(format!("failed to run build command: {}", e)))?;

    if !status.success() {
        return Err(FdeError::Deploy(format!(
            "build command failed (exit code {})",
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}
