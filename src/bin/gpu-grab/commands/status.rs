use anyhow::Result;
use gpu_grab::client::Client;
use gpu_grab::utils::format_duration;
use owo_colors::OwoColorize;
use std::time::Duration;

pub(crate) async fn handle_status(client: &Client) -> Result<()> {
    let data = client.status().await?;

    println!("{}", "=== GPU Status ===".bold());
    let gpus = data["gpus"].as_array().cloned().unwrap_or_default();
    if gpus.is_empty() {
        println!("  (no GPUs visible)");
    }
    for gpu in &gpus {
        println!(
            "  GPU {}: {}",
            gpu["index"],
            gpu["name"].as_str().unwrap_or("unknown")
        );
        println!(
            "    Memory: {}/{} MB ({} MB free)",
            gpu["used_memory_mb"], gpu["total_memory_mb"], gpu["free_memory_mb"]
        );
        println!("    Utilization: {}%", gpu["utilization_percent"]);
        println!("    Temperature: {}C", gpu["temperature"]);
    }

    println!();
    println!("{}", "=== Task Statistics ===".bold());
    let tasks = &data["tasks"];
    println!("  Pending:   {}", tasks["pending"]);
    println!("  Running:   {}", tasks["running"]);
    println!("  Completed: {}", tasks["completed"]);
    println!("  Failed:    {}", tasks["failed"]);
    println!("  Cancelled: {}", tasks["cancelled"]);

    println!();
    println!("{}", "=== Service ===".bold());
    let running = data["running"].as_bool().unwrap_or(false);
    if running {
        println!("  Status: {}", "Running".green());
    } else {
        println!("  Status: {}", "Stopped".red());
    }
    let uptime = data["uptime_seconds"].as_f64().unwrap_or(0.0);
    println!(
        "  Uptime: {}",
        format_duration(Duration::from_secs(uptime as u64))
    );
    if let Some(config) = data.get("config") {
        println!("  Check Interval: {}s", config["check_interval"]);
        println!("  Max Concurrent: {}", config["max_concurrent_tasks"]);
    }

    Ok(())
}
