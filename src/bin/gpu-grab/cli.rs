use clap::Parser;
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gpu-grab",
    author,
    version,
    about = "GPU training task scheduler",
    styles = gpu_grab::utils::STYLES
)]
pub struct GpuGrab {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,

    /// Path to the config file (default: ~/.gpu-grab/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Submit a new task
    Submit(SubmitArgs),
    /// Show system status
    Status,
    /// List tasks
    #[command(alias = "ls")]
    List(ListArgs),
    /// Cancel a task
    Cancel(CancelArgs),
    /// View task logs
    Logs(LogsArgs),
    /// Remove old finished tasks
    Cleanup(CleanupArgs),
    /// Generate tab-completion scripts for your shell
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct SubmitArgs {
    /// Command to execute (run through a shell)
    pub command: String,

    /// Task name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Working directory (default: current directory)
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Specific GPU IDs to use (e.g. 0,1)
    #[arg(short, long)]
    pub gpus: Option<String>,

    /// Number of GPUs required
    #[arg(short = 'c', long, default_value_t = 1)]
    pub gpu_count: usize,

    /// Minimum free memory per GPU (GB)
    #[arg(short, long, default_value_t = 0.0)]
    pub memory: f64,

    /// Required idle margin in percent (util must stay below 100 - margin)
    #[arg(short, long, default_value_t = 0.0)]
    pub util_margin: f64,

    /// Task priority (higher runs earlier)
    #[arg(short, long, default_value_t = 0)]
    pub priority: i32,

    /// Environment variables (KEY=VALUE, repeatable)
    #[arg(short, long)]
    pub env: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Filter by status
    #[arg(
        short,
        long,
        default_value = "all",
        value_parser = ["all", "pending", "running", "completed", "failed", "cancelled"]
    )]
    pub status: String,
}

#[derive(Debug, Parser)]
pub struct CancelArgs {
    /// The ID of the task to cancel
    pub task_id: String,
}

#[derive(Debug, Parser)]
pub struct LogsArgs {
    /// The ID of the task to show logs for
    pub task_id: String,

    /// Number of lines to show (0 = whole file)
    #[arg(short, long, default_value_t = 100)]
    pub tail: usize,

    /// Follow log output (reserved; answered with a plain tail)
    #[arg(short, long)]
    pub follow: bool,
}

#[derive(Debug, Parser)]
pub struct CleanupArgs {
    /// Remove terminal tasks older than this many days
    #[arg(short = 'd', long, default_value_t = 7)]
    pub max_age_days: i64,
}

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// The shell to generate the completions for
    pub shell: Shell,
}
