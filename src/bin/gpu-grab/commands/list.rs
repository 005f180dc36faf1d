use crate::cli::ListArgs;
use anyhow::Result;
use gpu_grab::client::Client;
use gpu_grab::core::task::{Task, TaskStatus};
use owo_colors::OwoColorize;
use tabled::{builder::Builder, settings::style::Style};

pub(crate) async fn handle_list(client: &Client, args: ListArgs) -> Result<()> {
    let tasks = client.list(&args.status).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let mut builder = Builder::default();
    builder.push_record(["ID", "Name", "Status", "GPUs", "Created", "Exit"]);
    for task in &tasks {
        builder.push_record([
            task.id.clone(),
            truncated(task.display_name(), 24),
            colored_status(task),
            assigned_gpus(task),
            task.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            task.exit_code.map_or_else(|| "-".to_string(), |c| c.to_string()),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn truncated(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max - 1).collect();
        format!("{cut}…")
    }
}

fn colored_status(task: &Task) -> String {
    match task.status {
        TaskStatus::Pending => task.status.to_string().yellow().to_string(),
        TaskStatus::Running => task.status.to_string().green().to_string(),
        TaskStatus::Completed => task.status.to_string().blue().to_string(),
        TaskStatus::Failed => task.status.to_string().red().to_string(),
        TaskStatus::Cancelled => task.status.to_string().dimmed().to_string(),
    }
}

fn assigned_gpus(task: &Task) -> String {
    if task.assigned_gpus.is_empty() {
        "-".to_string()
    } else {
        task.assigned_gpus
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated() {
        assert_eq!(truncated("short", 10), "short");
        assert_eq!(truncated("exactly-ten", 11), "exactly-ten");
        let long = truncated("a-very-long-task-name", 8);
        assert_eq!(long.chars().count(), 8);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_assigned_gpus() {
        let mut task = Task::default();
        assert_eq!(assigned_gpus(&task), "-");
        task.assigned_gpus = vec![0, 3];
        assert_eq!(assigned_gpus(&task), "0,3");
    }
}
