use anyhow::{anyhow, Context, Result};
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use std::collections::HashMap;
use std::time::Duration;

/// Parse `KEY=VALUE` pairs into an environment map.
///
/// # Examples
///
/// ```
/// use gpu_grab::utils::parse_env_vars;
///
/// let env = parse_env_vars(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
/// assert_eq!(env.get("A").map(String::as_str), Some("1"));
/// assert_eq!(env.get("B").map(String::as_str), Some("x=y"));
/// ```
pub fn parse_env_vars(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid environment variable '{pair}'. Expected KEY=VALUE"))?;
        if key.is_empty() {
            return Err(anyhow!("Invalid environment variable '{pair}'. Empty key"));
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Parse a comma-separated GPU index list like `"0,1,3"`.
///
/// # Examples
///
/// ```
/// use gpu_grab::utils::parse_gpu_list;
///
/// assert_eq!(parse_gpu_list("0").unwrap(), vec![0]);
/// assert_eq!(parse_gpu_list("0, 2,1").unwrap(), vec![0, 2, 1]);
/// ```
pub fn parse_gpu_list(spec: &str) -> Result<Vec<u32>> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .with_context(|| format!("Invalid GPU index '{part}'"))
        })
        .collect()
}

/// Render a daemon uptime or task runtime for display, dropping leading
/// zero units: `"9s"`, `"12m 9s"`, `"1h 15m 30s"`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use gpu_grab::utils::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(9)), "9s");
/// assert_eq!(format_duration(Duration::from_secs(729)), "12m 9s");
/// assert_eq!(format_duration(Duration::from_secs(4530)), "1h 15m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, s) => format!("{h}h {m}m {s}s"),
    }
}

/// Keep the last `n` lines of `content`, preserving line endings.
pub fn tail_lines(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    if lines.len() <= n {
        content.to_string()
    } else {
        lines[lines.len() - n..].concat()
    }
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_vars_rejects_bad_pairs() {
        assert!(parse_env_vars(&["NOEQUALS".to_string()]).is_err());
        assert!(parse_env_vars(&["=value".to_string()]).is_err());
        assert!(parse_env_vars(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_gpu_list_rejects_garbage() {
        assert!(parse_gpu_list("0,x").is_err());
        assert!(parse_gpu_list("-1").is_err());
        assert_eq!(parse_gpu_list("").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb\nc\n", 10), "a\nb\nc\n");
        // No trailing newline on the last line.
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("", 5), "");
    }
}
