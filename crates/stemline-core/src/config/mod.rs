//! Engine configuration
//!
//! - Generic YAML config loading/saving
//! - Config path utilities
//! - Audio options, per-stem volumes and output settings
//! - The settings provider consumed by stem channels
//!
//! # Usage
//!
//! ```ignore
//! use stemline_core::config::{default_config_path, load_config, EngineConfig, SettingsManager};
//!
//! let config: EngineConfig = load_config(&default_config_path("config.yaml"));
//! let settings = SettingsManager::new(config);
//! ```

mod io;
mod options;
mod paths;

pub use io::{load_config, save_config};
pub use options::{AudioManager, AudioOptions, EngineConfig, OutputConfig, SettingsManager, StemVolumes};
pub use paths::{default_config_dir, default_config_path};
