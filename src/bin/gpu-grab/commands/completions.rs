use crate::cli::{CompletionsArgs, GpuGrab};
use anyhow::Result;
use clap::CommandFactory;

pub(crate) fn handle_completions(args: &CompletionsArgs) -> Result<()> {
    let mut cmd = GpuGrab::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(args.shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}
