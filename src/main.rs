use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use script_jobs::config::ManagerConfig;
use script_jobs::control::JobControl;
use script_jobs::jobs::JobManager;

/// Line-oriented JSON front end: one request per stdin line, one reply per stdout line.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries replies only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ManagerConfig::from_env()?;
    tracing::info!(
        jobs_dir = ?config.jobs_dir,
        interpreter = ?config.interpreter,
        result_mode = ?config.result_mode,
        "Script jobs v{} ready",
        env!("CARGO_PKG_VERSION")
    );

    let manager = Arc::new(JobManager::new(config));
    let control = JobControl::new(Arc::clone(&manager));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = control.dispatch(line).await;
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    manager.shutdown().await;
    Ok(())
}
