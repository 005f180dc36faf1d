use crate::cli::CancelArgs;
use anyhow::Result;
use gpu_grab::client::Client;

pub(crate) async fn handle_cancel(client: &Client, args: CancelArgs) -> Result<()> {
    if client.cancel(&args.task_id).await? {
        println!("Task {} cancelled.", args.task_id);
    } else {
        println!("Task {} was already finished.", args.task_id);
    }
    Ok(())
}
