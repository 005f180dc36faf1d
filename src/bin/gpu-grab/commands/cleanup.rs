use crate::cli::CleanupArgs;
use anyhow::Result;
use gpu_grab::client::Client;

pub(crate) async fn handle_cleanup(client: &Client, args: CleanupArgs) -> Result<()> {
    let removed = client.cleanup(args.max_age_days).await?;
    println!("Removed {removed} old task(s).");
    Ok(())
}
