use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gpu-grabd",
    author,
    version,
    about = "GPU Grab scheduler daemon",
    styles = gpu_grab::utils::STYLES
)]
pub struct GpuGrabd {
    /// Path to the config file (default: ~/.gpu-grab/config.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log to stdout only, skipping the daemon log file
    #[arg(long)]
    pub no_log_file: bool,

    /// Write the effective configuration back to the config file and exit
    #[arg(long)]
    pub init_config: bool,
}
