use std::path::PathBuf;

/// Data directory: `~/.local/share/snapstack/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("snapstack")
}

/// Layer transcript directory: `~/.local/share/snapstack/logs/`
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}
