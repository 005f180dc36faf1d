use crate::cli::Commands;
use anyhow::Result;
use gpu_grab::client::Client;
use gpu_grab::config::Config;
use std::path::Path;

mod cancel;
mod cleanup;
mod completions;
mod list;
mod logs;
mod status;
mod submit;

pub async fn handle_commands(config_path: Option<&Path>, command: Commands) -> Result<()> {
    // Completions never talk to the daemon.
    if let Commands::Completions(args) = &command {
        return completions::handle_completions(args);
    }

    let config = Config::load(config_path)?;
    let client = Client::build(&config);

    match command {
        Commands::Submit(args) => submit::handle_submit(&client, args).await,
        Commands::Status => status::handle_status(&client).await,
        Commands::List(args) => list::handle_list(&client, args).await,
        Commands::Cancel(args) => cancel::handle_cancel(&client, args).await,
        Commands::Logs(args) => logs::handle_logs(&client, args).await,
        Commands::Cleanup(args) => cleanup::handle_cleanup(&client, args).await,
        Commands::Completions(_) => unreachable!("handled above"),
    }
}
