//! Audio options, stem volumes and the settings provider

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{SongStem, SAMPLE_RATE};

/// Playback options read by stem channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioOptions {
    /// Enable the whammy pitch-bend effect
    pub use_whammy_fx: bool,

    /// Stems that get a pitch-bend effect when whammy is enabled
    pub pitch_bend_stems: Vec<SongStem>,

    /// Overlap factor of the pitch-shift analysis windows
    /// Default: 8
    pub whammy_oversample_factor: u32,

    /// Pitch-shift FFT window size in samples
    /// Also the latency the window adds, compensated in reported positions.
    /// Default: 512
    pub whammy_fft_size: u32,

    /// Pitch drop at full whammy, in semitones
    /// Default: 2.0
    pub whammy_pitch_shift_semitones: f32,

    /// Raise pitch with speed instead of preserving it
    pub chipmunk_speedup: bool,

    /// Fixed output latency compensated in reported positions, in seconds
    /// Default: 0.0
    pub playback_buffer_desync: f64,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            use_whammy_fx: true,
            pitch_bend_stems: vec![SongStem::Guitar, SongStem::Bass, SongStem::Rhythm],
            whammy_oversample_factor: 8,
            whammy_fft_size: 512,
            whammy_pitch_shift_semitones: 2.0,
            chipmunk_speedup: false,
            playback_buffer_desync: 0.0,
        }
    }
}

impl AudioOptions {
    /// Whether a stem gets the pitch-bend effect
    pub fn is_pitch_bend_stem(&self, stem: SongStem) -> bool {
        self.use_whammy_fx && self.pitch_bend_stems.contains(&stem)
    }
}

/// Per-stem base volumes
///
/// Stems without an entry use [`StemVolumes::default_for`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemVolumes {
    pub stems: BTreeMap<SongStem, f64>,
}

impl StemVolumes {
    /// Built-in base volume of a stem
    pub fn default_for(stem: SongStem) -> f64 {
        match stem {
            SongStem::Crowd => 0.5,
            SongStem::Sfx => 0.8,
            _ => 1.0,
        }
    }

    /// Base volume of a stem (0.0-1.0)
    pub fn get(&self, stem: SongStem) -> f64 {
        self.stems
            .get(&stem)
            .copied()
            .unwrap_or_else(|| Self::default_for(stem))
    }

    /// Set the base volume of a stem, clamped to 0.0-1.0
    pub fn set(&mut self, stem: SongStem, volume: f64) {
        self.stems.insert(stem, volume.clamp(0.0, 1.0));
    }
}

/// Audio output device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device name (None = system default)
    pub device: Option<String>,
    /// Preferred sample rate in Hz
    pub sample_rate: u32,
    /// Preferred buffer size in frames
    pub buffer_size: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: SAMPLE_RATE,
            buffer_size: 512,
        }
    }
}

/// Top-level configuration file (`config.yaml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub options: AudioOptions,
    pub volumes: StemVolumes,
    pub output: OutputConfig,
}

/// Settings provider consumed by stem channels
pub trait AudioManager: Send + Sync {
    /// User-configured base volume of a stem
    fn volume_setting(&self, stem: SongStem) -> f64;

    /// Current playback options
    fn options(&self) -> AudioOptions;
}

/// Live-editable settings shared between the control thread and channels
#[derive(Debug, Default)]
pub struct SettingsManager {
    config: RwLock<EngineConfig>,
}

impl SettingsManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Snapshot of the whole configuration
    pub fn config(&self) -> EngineConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change the base volume of a stem
    ///
    /// Channels pick the new value up on their next volume update.
    pub fn set_volume(&self, stem: SongStem, volume: f64) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .volumes
            .set(stem, volume);
    }

    /// Edit the playback options in place
    pub fn update_options(&self, update: impl FnOnce(&mut AudioOptions)) {
        update(&mut self.config.write().unwrap_or_else(PoisonError::into_inner).options);
    }

    /// Save the current configuration as YAML
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        super::save_config(&self.config(), path)
    }
}

impl AudioManager for SettingsManager {
    fn volume_setting(&self, stem: SongStem) -> f64 {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .volumes
            .get(stem)
    }

    fn options(&self) -> AudioOptions {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .options
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_volumes() {
        let volumes = StemVolumes::default();
        assert_eq!(volumes.get(SongStem::Drums), 1.0);
        assert_eq!(volumes.get(SongStem::Crowd), 0.5);
        assert_eq!(volumes.get(SongStem::Sfx), 0.8);
    }

    #[test]
    fn test_volume_set_is_clamped() {
        let mut volumes = StemVolumes::default();
        volumes.set(SongStem::Bass, 1.5);
        volumes.set(SongStem::Keys, -0.2);
        assert_eq!(volumes.get(SongStem::Bass), 1.0);
        assert_eq!(volumes.get(SongStem::Keys), 0.0);
    }

    #[test]
    fn test_pitch_bend_eligibility() {
        let mut options = AudioOptions::default();
        assert!(options.is_pitch_bend_stem(SongStem::Guitar));
        assert!(!options.is_pitch_bend_stem(SongStem::Drums));

        options.use_whammy_fx = false;
        assert!(!options.is_pitch_bend_stem(SongStem::Guitar));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "options:\n  chipmunk_speedup: true\nvolumes:\n  stems:\n    drums: 0.4\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();

        assert!(config.options.chipmunk_speedup);
        assert_eq!(config.options.whammy_fft_size, 512);
        assert_eq!(config.volumes.get(SongStem::Drums), 0.4);
        assert_eq!(config.output.sample_rate, 48000);
    }

    #[test]
    fn test_settings_manager_live_edit() {
        let settings = SettingsManager::new(EngineConfig::default());
        settings.set_volume(SongStem::Vocals, 0.3);
        settings.update_options(|o| o.whammy_pitch_shift_semitones = 12.0);

        assert_eq!(settings.volume_setting(SongStem::Vocals), 0.3);
        assert_eq!(settings.options().whammy_pitch_shift_semitones, 12.0);
    }
}
