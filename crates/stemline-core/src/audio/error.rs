//! Output device errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No output devices on the default host")]
    NoDevices,

    #[error("Default output device unavailable: {0}")]
    NoDefaultDevice(String),

    /// No device with the configured name
    #[error("No output device named {0}")]
    DeviceNotFound(String),

    #[error("Cannot query output configurations: {0}")]
    ConfigError(String),

    #[error("Cannot open output stream: {0}")]
    StreamBuildError(String),

    #[error("Output stream refused to start: {0}")]
    StreamPlayError(String),

    /// The device cannot run at the rate the engine renders at
    #[error("Device tops out at {device}Hz but the engine renders at {engine}Hz")]
    SampleRateMismatch { device: u32, engine: u32 },
}

pub type AudioResult<T> = Result<T, AudioError>;
