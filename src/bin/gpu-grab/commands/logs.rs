use crate::cli::LogsArgs;
use anyhow::Result;
use gpu_grab::client::Client;
use std::io::Write;

pub(crate) async fn handle_logs(client: &Client, args: LogsArgs) -> Result<()> {
    // `--follow` is passed through on the wire but the daemon only serves
    // point-in-time reads, so the answer is a plain tail either way.
    let content = client.logs(&args.task_id, args.tail, args.follow).await?;
    print!("{content}");
    std::io::stdout().flush()?;
    Ok(())
}
