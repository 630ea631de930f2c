//! Platform-specific paths

use std::path::PathBuf;

const APP_DIR_NAME: &str = "keyring-autolock";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the platform-specific config directory
///
/// Returns:
/// - Linux/Other: $XDG_CONFIG_HOME/keyring-autolock (usually ~/.config/keyring-autolock)
/// - macOS: ~/Library/Application Support/keyring-autolock
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR_NAME)
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    get_config_dir().join(CONFIG_FILE_NAME)
}

/// Ensure the config directory exists, creating it if necessary
pub fn ensure_config_dir() -> std::io::Result<PathBuf> {
    let dir = get_config_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_config_dir() {
        let dir = get_config_dir();
        assert!(dir.to_string_lossy().ends_with("keyring-autolock"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().ends_with("config.toml"));
        assert_eq!(path.parent(), Some(get_config_dir().as_path()));
    }
}
