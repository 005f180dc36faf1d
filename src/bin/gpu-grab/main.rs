use clap::{CommandFactory, Parser};
use cli::GpuGrab;

mod cli;
mod commands;

#[tokio::main]
async fn main() {
    let args = GpuGrab::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.verbose.tracing_level_filter())
        .without_time()
        .with_target(false)
        .init();

    let Some(command) = args.command else {
        let _ = GpuGrab::command().print_help();
        return;
    };

    if let Err(e) = commands::handle_commands(args.config.as_deref(), command).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
