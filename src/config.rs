//! Optional config from .narsyncrc or ~/.narsyncrc (JSON). Env and caller
//! arguments override these.

use std::path::Path;

use crate::compress::Compression;

/// Optional config from file. Callers override any field they set explicitly.
#[derive(Default)]
pub struct Config {
    pub endpoint: Option<String>,
    pub compression: Option<Compression>,
    pub max_jobs: Option<usize>,
    pub secret_key_file: Option<String>,
    /// Rendered trusted public keys, `name:base64(key)`.
    pub trusted_keys: Vec<String>,
}

/// Load config from .narsyncrc in dir, then ~/.narsyncrc. Missing or invalid file = default.
pub fn load_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    let home = dirs_home();
    let candidates = [
        dir.join(".narsyncrc"),
        home.map(|h| h.join(".narsyncrc")).unwrap_or_else(|| dir.join(".none")),
    ];
    for path in &candidates {
        if path.is_file() {
            if let Ok(s) = std::fs::read_to_string(path) {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&s) {
                    if let Some(e) = v.get("endpoint").and_then(|x| x.as_str()) {
                        cfg.endpoint = Some(e.to_string());
                    }
                    if let Some(c) = v.get("compression").and_then(|x| x.as_str()) {
                        cfg.compression = Compression::parse(c).ok();
                    }
                    if let Some(j) = v.get("maxJobs").and_then(|x| x.as_u64()) {
                        cfg.max_jobs = Some(j as usize);
                    }
                    if let Some(k) = v.get("secretKeyFile").and_then(|x| x.as_str()) {
                        cfg.secret_key_file = Some(k.to_string());
                    }
                    if let Some(keys) = v.get("trustedKeys").and_then(|x| x.as_array()) {
                        cfg.trusted_keys = keys
                            .iter()
                            .filter_map(|x| x.as_str().map(String::from))
                            .collect();
                    }
                }
            }
            break;
        }
    }
    cfg
}

fn dirs_home() -> Option<std::path::PathBuf> {
    #[cfg(unix)]
    {
        std::env::var("HOME").ok().map(std::path::PathBuf::from)
    }
    #[cfg(windows)]
    {
        std::env::var("USERPROFILE").ok().map(std::path::PathBuf::from)
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}
