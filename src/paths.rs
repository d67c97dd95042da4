use std::path::{Path, PathBuf};

/// Environment variable overriding the cfdev home directory.
pub const HOME_ENV: &str = "CFDEV_HOME";

/// cfdev home: `$CFDEV_HOME`, otherwise `~/.cfdev/`.
pub fn home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".cfdev")
}

/// Default config file: `<home>/cfdev.toml`
pub fn config_file(home: &Path) -> PathBuf {
    home.join("cfdev.toml")
}

/// Verified asset cache: `<home>/cache/`
pub fn cache_dir(home: &Path) -> PathBuf {
    home.join("cache")
}

/// Driver and daemon state (pid files, sockets, consoles): `<home>/state/`
pub fn state_dir(home: &Path) -> PathBuf {
    home.join("state")
}

/// Per-backend state directory, owned exclusively by that driver.
pub fn backend_dir(home: &Path, backend: &str) -> PathBuf {
    state_dir(home).join(backend)
}

/// Daemon runner pid files and logs: `<home>/state/daemons/`
pub fn daemons_dir(home: &Path) -> PathBuf {
    state_dir(home).join("daemons")
}

/// Analytics consent toggle and outbound spool: `<home>/analytics/`
pub fn analytics_dir(home: &Path) -> PathBuf {
    home.join("analytics")
}

pub fn toggle_file(home: &Path) -> PathBuf {
    analytics_dir(home).join("analytics.json")
}

pub fn spool_file(home: &Path) -> PathBuf {
    analytics_dir(home).join("spool.jsonl")
}

/// Main log file for VM commands: `<home>/log/cfdev.log`
pub fn log_file(home: &Path) -> PathBuf {
    home.join("log").join("cfdev.log")
}
