//! Platform-specific paths and host information

use std::path::PathBuf;

/// Get the platform-specific data directory for storing the vault
///
/// Returns:
/// - Windows: %APPDATA%\QuillSpace
/// - macOS: ~/Library/Application Support/QuillSpace
/// - Linux/Other: ~/.local/share/QuillSpace
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("QuillSpace")
}

/// Get the default vault database path
pub fn get_default_vault_path() -> PathBuf {
    get_data_dir().join("vault.db")
}

/// Default human-readable name for this device, derived from the hostname
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "quillspace-device".to_string())
}
