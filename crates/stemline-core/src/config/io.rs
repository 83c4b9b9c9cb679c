//! YAML load/save shared by every config type

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Read a YAML config, falling back to `T::default()`
///
/// A missing file gives defaults quietly. An unreadable or malformed file is
/// logged and ignored.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("[CONFIG] No config at {}, using defaults", path.display());
        return T::default();
    }

    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_yaml::from_str::<T>(&text).map_err(|e| e.to_string()));

    match parsed {
        Ok(config) => {
            log::info!("[CONFIG] Loaded {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("[CONFIG] Ignoring {}: {}", path.display(), e);
            T::default()
        }
    }
}

/// Write `config` as YAML, creating missing parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let text = serde_yaml::to_string(config).context("cannot serialize config")?;
    std::fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))?;
    log::info!("[CONFIG] Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::SongStem;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: EngineConfig = load_config(Path::new("/nonexistent/path/config.yaml"));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_yaml_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "options: [not, a, map").unwrap();

        let config: EngineConfig = load_config(&path);
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_roundtrip_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = EngineConfig::default();
        config.options.chipmunk_speedup = true;
        config.volumes.set(SongStem::Drums, 0.25);
        config.output.device = Some("pulse".to_string());

        save_config(&config, &path).unwrap();
        let loaded: EngineConfig = load_config(&path);

        assert_eq!(loaded, config);
    }
}
