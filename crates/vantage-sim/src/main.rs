//! Vantage simulator binary.
//!
//! Loads a scenario, replays it against the trackers and prints the delivered
//! records to stdout, one JSON object per line. Logs go to stderr.

use std::io::Write;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use vantage_sim::{load_config, run, SimError};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VANTAGE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

async fn simulate() -> Result<usize, SimError> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("scenario.toml"));

    let config = load_config(selected_config_path)?;

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved scenario path"
    );

    let stdout = std::io::stdout();
    run(&config, |line| {
        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{line}") {
            tracing::warn!(error = %e, "failed to write record");
        }
    })
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    match simulate().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "simulation failed");
            eprintln!("vantage-sim: {e}");
            ExitCode::FAILURE
        }
    }
}
