use anyhow::{Context, Result};
use clap::Parser;
use gpu_grab::config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod cli;
mod server;

fn init_tracing(
    config: &Config,
    no_log_file: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if no_log_file {
        let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::never(config.logs_dir(), "gpu-grab.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::GpuGrabd::parse();
    let config = Config::load(args.config.as_deref())?;

    if args.init_config {
        config.save(args.config.as_deref())?;
        let path = args
            .config
            .unwrap_or_else(|| config.base_dir.join("config.yaml"));
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    config
        .ensure_dirs()
        .context("failed to prepare daemon directories")?;

    let _guard = init_tracing(&config, args.no_log_file)?;

    tracing::info!("GPU Grab daemon starting");
    tracing::info!("check interval: {}s", config.check_interval);
    tracing::info!("max concurrent tasks: {}", config.max_concurrent_tasks);

    server::run(config).await
}
