//! Path utilities for stemline configuration files

use std::path::PathBuf;

/// Get the default configuration directory
///
/// Returns: `<platform config dir>/stemline` (e.g. `~/.config/stemline`)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stemline")
}

/// Get the default path of a config file
pub fn default_config_path(filename: &str) -> PathBuf {
    default_config_dir().join(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_ends_with_stemline() {
        assert!(default_config_dir().ends_with("stemline"));
    }

    #[test]
    fn test_config_path_includes_filename() {
        let path = default_config_path("config.yaml");
        assert!(path.ends_with("stemline/config.yaml"));
    }
}
