//! Entrypoint: set up tracing, load settings, run the patch pipeline once.
//!
//! The run is strictly sequential:
//!  - export matching series to `file`
//!  - excise points inside the removal window into `output`
//!  - delete the matching series from the remote store
//!  - import `output` back
//!
//! Any error is fatal and the process exits with status 1.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use vm_patch_metrics::config::{Cli, Settings};
use vm_patch_metrics::errors::PatchError;
use vm_patch_metrics::metrics;
use vm_patch_metrics::pipeline::{Pipeline, RunReport};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // `--help`, `--version` and flag errors exit here.
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match Settings::new(cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(?settings, "Loaded configuration");

    let metrics_file = settings.metrics_file.clone();
    let result = run(settings).await;

    if let Some(path) = metrics_file {
        if let Err(e) = metrics::write_textfile(&path) {
            error!(error = %e, "Failed to write metrics file");
        }
    }

    match result {
        Ok(report) => {
            info!(
                exported_bytes = report.exported_bytes,
                series = report.excise.series,
                patched = report.excise.patched,
                points_removed = report.excise.points_removed,
                "Patch complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Patch aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<RunReport, PatchError> {
    let mut pipeline = Pipeline::new(settings)?;
    pipeline.run().await
}
