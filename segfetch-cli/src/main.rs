mod cli;
mod config;
mod error;
mod output;
mod playlist;

use crate::{cli::Args, config::AppConfig, error::AppError, error::Result, output::ProgressReporter};
use clap::Parser;
use segfetch_engine::{
    BatchStatus, DownloadCoordinator, EngineConfig, RequestConfig, TransferManager,
};
use std::{path::PathBuf, process, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let result = engine_config(&args).and_then(|engine| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(engine.io_threads)
            .enable_all()
            .build()?;
        runtime.block_on(run(args, engine))
    });

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn engine_config(args: &Args) -> Result<EngineConfig> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    config.merge_args(args)?;
    config.engine_config()
}

/// Returns whether every segment was downloaded.
async fn run(args: Args, engine: EngineConfig) -> Result<bool> {
    let grace = engine.shutdown_grace;

    let url = Url::parse(&args.url)?;
    let manager = Arc::new(TransferManager::new(engine)?);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping downloads");
                token.cancel();
            }
        });
    }

    let request = Arc::new(RequestConfig::default());
    let download = tokio::select! {
        download = playlist::resolve(&manager, &url, &args.output_dir, &request) => download?,
        _ = token.cancelled() => return Err(AppError::Interrupted),
    };
    let segments: Vec<PathBuf> = download.segments.iter().map(|s| s.dest.clone()).collect();
    info!(
        url = %url,
        segments = segments.len(),
        output_dir = %args.output_dir.display(),
        "Playlist resolved"
    );

    let coordinator = DownloadCoordinator::new(Arc::clone(&manager));
    let report = coordinator
        .run(vec![download], token.clone(), &ProgressReporter::default())
        .await;
    manager.shutdown(grace).await;

    if report.status == BatchStatus::Stopped {
        return Err(AppError::Interrupted);
    }
    for failure in report.downloads.iter().flat_map(|d| &d.failures) {
        error!(index = failure.index, url = %failure.uri, kind = ?failure.kind, "{}", failure.message);
    }
    if !report.is_success() {
        return Ok(false);
    }

    if let Some(output) = &args.concat {
        output::concat(&segments, output).await?;
    }
    Ok(true)
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}
