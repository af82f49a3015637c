use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;

use chrono::Local;

pub const LOG_FILE: &str = "logs.txt";

/// Returns the path to the cache directory. Uses NARSYNC_CACHE_DIR if set;
/// otherwise Windows: %USERPROFILE%\.narsync-cache, Unix: $HOME/.narsync-cache
pub fn get_cache_dir() -> String {
    if let Ok(dir) = env::var("NARSYNC_CACHE_DIR") {
        return dir;
    }
    let base = if cfg!(target_os = "windows") {
        env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string())
    } else {
        env::var("HOME").unwrap_or_else(|_| ".".to_string())
    };
    let sep = if cfg!(target_os = "windows") { "\\" } else { "/" };
    format!("{}{}.narsync-cache", base, sep)
}

fn is_quiet() -> bool {
    if env::var("NARSYNC_QUIET").map(|v| v == "1" || v == "true").unwrap_or(false) {
        return true;
    }
    env::var("NARSYNC_LOG")
        .map(|v| v.to_lowercase() == "quiet" || v.to_lowercase() == "error")
        .unwrap_or(false)
}

pub fn log(message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let log_message = format!("[{}] {}", timestamp, message);

    // When NARSYNC_QUIET or NARSYNC_LOG=quiet, never print logs to stdout (only to file)
    if !is_quiet() {
        println!("{}", log_message);
    }

    // Append-only; a missing or unwritable log file never fails an operation.
    let cache_dir = get_cache_dir();
    let _ = fs::create_dir_all(&cache_dir);
    let log_path = format!("{}/{}", cache_dir, LOG_FILE);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
        let _ = writeln!(file, "{}", log_message);
    }
}

pub fn log_error(message: &str) {
    eprintln!("{}", message);
    log(message);
}

/// "1 path" / "7 paths" for log lines.
pub fn tell_size(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

/// Worker count for parallel transfer: NARSYNC_MAX_JOBS if set, else CPUs (capped).
pub fn max_jobs_from_env() -> usize {
    const MAX_JOBS_CAP: usize = 64;
    env::var("NARSYNC_MAX_JOBS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.clamp(1, MAX_JOBS_CAP))
        .unwrap_or_else(|| num_cpus::get().clamp(1, MAX_JOBS_CAP))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tell_size() {
        assert_eq!(tell_size(1, "path"), "1 path");
        assert_eq!(tell_size(3, "store object"), "3 store objects");
    }

    #[test]
    fn test_max_jobs_is_positive() {
        assert!(max_jobs_from_env() >= 1);
    }
}
