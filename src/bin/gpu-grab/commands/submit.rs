use crate::cli::SubmitArgs;
use anyhow::{Context, Result};
use gpu_grab::client::Client;
use gpu_grab::core::protocol::SubmitParams;
use gpu_grab::utils::{parse_env_vars, parse_gpu_list};

pub(crate) async fn handle_submit(client: &Client, args: SubmitArgs) -> Result<()> {
    let params = build_params(args)?;
    let task_id = client.submit(&params).await?;
    println!("Task submitted successfully. ID: {task_id}");
    Ok(())
}

fn build_params(args: SubmitArgs) -> Result<SubmitParams> {
    let working_dir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()
            .context("failed to get current directory")?
            .display()
            .to_string(),
    };
    let gpu_ids = args
        .gpus
        .as_deref()
        .map(parse_gpu_list)
        .transpose()?
        .filter(|ids| !ids.is_empty());

    Ok(SubmitParams {
        command: args.command,
        name: args
            .name
            .unwrap_or_else(|| format!("task-{}", std::process::id())),
        working_dir,
        env: parse_env_vars(&args.env)?,
        gpu_ids,
        min_free_memory_gb: Some(args.memory),
        max_util_percent: Some(100.0 - args.util_margin),
        gpu_count: Some(args.gpu_count),
        priority: args.priority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &str) -> SubmitArgs {
        SubmitArgs {
            command: command.to_string(),
            name: None,
            workdir: None,
            gpus: None,
            gpu_count: 1,
            memory: 0.0,
            util_margin: 0.0,
            priority: 0,
            env: Vec::new(),
        }
    }

    #[test]
    fn test_util_margin_becomes_ceiling() {
        let mut a = args("true");
        a.util_margin = 30.0;
        let params = build_params(a).unwrap();
        assert_eq!(params.max_util_percent, Some(70.0));
    }

    #[test]
    fn test_defaults_fill_in() {
        let params = build_params(args("true")).unwrap();
        assert!(params.name.starts_with("task-"));
        assert!(!params.working_dir.is_empty());
        assert_eq!(params.gpu_ids, None);
    }

    #[test]
    fn test_gpu_list_parsed() {
        let mut a = args("true");
        a.gpus = Some("0,2".to_string());
        a.env = vec!["A=1".to_string()];
        let params = build_params(a).unwrap();
        assert_eq!(params.gpu_ids, Some(vec![0, 2]));
        assert_eq!(params.env.get("A").map(String::as_str), Some("1"));
    }
}
