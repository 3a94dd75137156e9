use std::path::PathBuf;

pub const APP_ID: &str = "parley";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.1";

/// `$XDG_DATA_HOME/parley/parley.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> Option<PathBuf> {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .ok()?;
    Some(data_dir.join(APP_ID).join(format!("{}.db", APP_ID)))
}

pub fn default_user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}
