//! Decode backend - the native audio layer seen by stem channels
//!
//! A [`DecodeBackend`] opens files into decode sources, derives split and
//! tempo streams from them, exposes attribute and effect primitives, and
//! reports stream completion through sync callbacks.
//!
//! Every primitive takes `&self` and is individually atomic: control calls
//! may land while the audio thread is rendering. The engine does not
//! serialize calls on a channel beyond that.
//!
//! Handles are plain newtypes over a non-zero id. "No handle" is expressed
//! as `Option::None` by the callers, never as a zero id.
//!
//! The [`software`] module provides the pure-Rust implementation used by
//! the `stemline` binary.

pub mod software;

#[cfg(test)]
pub mod testing;

use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Wrap a raw id; zero is not a valid handle
            pub fn from_raw(raw: u32) -> Option<Self> {
                NonZeroU32::new(raw).map(Self)
            }

            /// Raw numeric id
            pub fn raw(&self) -> u32 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle_type!(
    /// Handle to a decode source, split stream or tempo stream
    StreamHandle
);
handle_type!(
    /// Handle to an effect attached to a stream
    FxHandle
);
handle_type!(
    /// Handle to a registered end-of-stream sync
    SyncHandle
);

/// Stream attributes that can be set, slid and read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelAttribute {
    /// Linear volume multiplier (0.0 = silent)
    Volume,
    /// Relative tempo in percent (0.0 = original speed, 100.0 = double)
    Tempo,
    /// Pitch shift of the tempo stage in semitones
    Pitch,
    /// Sample rate in Hz (read-only)
    Frequency,
}

/// Routing used for seeks and syncs
///
/// Channels plugged into a parent mixer graph must seek through the mixer so
/// its buffered output is discarded as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Standalone,
    Mixer,
}

/// Effect types understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Compressor,
    PeakEq,
    Reverb,
    PitchShift,
}

/// Compressor parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorParams {
    /// Output gain in dB
    pub gain_db: f32,
    /// Threshold in dBFS
    pub threshold_db: f32,
    /// Attack time in milliseconds
    pub attack_ms: f32,
    /// Release time in milliseconds
    pub release_ms: f32,
    /// Compression ratio (4.0 = 4:1)
    pub ratio: f32,
}

/// Peaking EQ band parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakEqParams {
    /// Center frequency in Hz
    pub center_hz: f32,
    /// Bandwidth in octaves
    pub bandwidth_octaves: f32,
    /// Gain in dB (negative = cut)
    pub gain_db: f32,
}

/// Freeverb parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbParams {
    /// Dry level (0.0-1.0)
    pub dry_mix: f32,
    /// Wet level (0.0-1.0)
    pub wet_mix: f32,
    /// Room size (0.0-1.0)
    pub room_size: f32,
    /// High frequency damping (0.0-1.0)
    pub damping: f32,
    /// Stereo width (0.0-1.0)
    pub width: f32,
}

/// Pitch shift parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchShiftParams {
    /// Frequency ratio (1.0 = unchanged, 0.5 = one octave down)
    pub pitch_shift: f32,
    /// Additional shift in semitones
    pub semitones: f32,
    /// FFT analysis window size in samples
    pub fft_size: u32,
    /// Overlap (oversampling) factor between analysis windows
    pub oversample_factor: u32,
}

/// Typed parameter block for [`DecodeBackend::set_fx_parameters`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EffectParams {
    Compressor(CompressorParams),
    PeakEq(PeakEqParams),
    Reverb(ReverbParams),
    PitchShift(PitchShiftParams),
}

impl EffectParams {
    /// The effect kind these parameters belong to
    pub fn kind(&self) -> EffectKind {
        match self {
            EffectParams::Compressor(_) => EffectKind::Compressor,
            EffectParams::PeakEq(_) => EffectKind::PeakEq,
            EffectParams::Reverb(_) => EffectKind::Reverb,
            EffectParams::PitchShift(_) => EffectKind::PitchShift,
        }
    }
}

/// Callback invoked by the backend when a stream reaches its end
///
/// Runs on the audio thread. Implementations must only hand work off.
pub type EndSyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Errors reported by the decode backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// File could not be opened
    #[error("Failed to open '{path}': {reason}")]
    FileOpen { path: PathBuf, reason: String },

    /// File opened but its format is unsupported or corrupt
    #[error("Unsupported audio format: {0}")]
    Format(String),

    /// Handle does not refer to a live object
    #[error("Invalid handle: {0}")]
    Handle(u32),

    /// Position outside the stream
    #[error("Position {0} is out of range")]
    Position(u64),

    /// Operation not valid for this kind of stream or effect
    #[error("Illegal type: {0}")]
    IllegalType(String),

    /// Parameter value rejected
    #[error("Illegal parameter: {0}")]
    IllegalParam(String),

    /// Requested data is not available
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Anything else
    #[error("Backend error: {0}")]
    Unknown(String),
}

impl BackendError {
    /// Stable numeric code for this error
    pub fn code(&self) -> i32 {
        match self {
            BackendError::FileOpen { .. } => 2,
            BackendError::Handle(_) => 5,
            BackendError::Position(_) => 7,
            BackendError::IllegalType(_) => 19,
            BackendError::IllegalParam(_) => 20,
            BackendError::NotAvailable(_) => 37,
            BackendError::Format(_) => 41,
            BackendError::Unknown(_) => -1,
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// The native decode/playback layer consumed by stem channels
pub trait DecodeBackend: Send + Sync {
    /// Open and pre-scan a file into a decode source
    fn create_stream(&self, path: &Path) -> BackendResult<StreamHandle>;

    /// Derive a split stream with its own read cursor from a source
    fn create_split_stream(&self, source: StreamHandle) -> BackendResult<StreamHandle>;

    /// Wrap a stream with a tempo/pitch stage
    ///
    /// The returned stream owns `input`: freeing it frees the input as well.
    fn create_tempo_stream(&self, input: StreamHandle) -> BackendResult<StreamHandle>;

    /// Reset the buffered read state of every split derived from `source`
    fn split_stream_reset(&self, source: StreamHandle) -> BackendResult<()>;

    /// Release a stream
    fn stream_free(&self, stream: StreamHandle) -> BackendResult<()>;

    /// Set an attribute immediately
    fn set_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
    ) -> BackendResult<()>;

    /// Ramp an attribute to `value` over `duration`, superseding any running ramp
    fn slide_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
        duration: Duration,
    ) -> BackendResult<()>;

    /// Read the current (possibly mid-ramp) value of an attribute
    fn get_attribute(&self, stream: StreamHandle, attribute: ChannelAttribute) -> BackendResult<f32>;

    /// Attach an effect; higher priority runs earlier in the chain
    fn set_fx(&self, stream: StreamHandle, kind: EffectKind, priority: i32) -> BackendResult<FxHandle>;

    /// Set the parameters of an attached effect
    fn set_fx_parameters(&self, fx: FxHandle, params: &EffectParams) -> BackendResult<()>;

    /// Detach an effect from a stream
    fn remove_fx(&self, stream: StreamHandle, fx: FxHandle) -> BackendResult<()>;

    /// Current read position in sample frames (source timeline)
    fn position(&self, stream: StreamHandle) -> BackendResult<u64>;

    /// Seek to a sample frame
    ///
    /// A frame at or past the end is accepted: the stream parks there, reads
    /// silence and fires its end syncs on the next render.
    fn set_position(&self, stream: StreamHandle, frame: u64, route: Route) -> BackendResult<()>;

    /// Total length in sample frames
    fn length(&self, stream: StreamHandle) -> BackendResult<u64>;

    /// Register a callback fired once the stream reaches its end
    fn set_end_sync(
        &self,
        stream: StreamHandle,
        route: Route,
        callback: EndSyncCallback,
    ) -> BackendResult<SyncHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_zero_is_invalid() {
        assert!(StreamHandle::from_raw(0).is_none());
        assert_eq!(StreamHandle::from_raw(7).map(|h| h.raw()), Some(7));
        assert_eq!(FxHandle::from_raw(3).unwrap().to_string(), "FxHandle#3");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(BackendError::Handle(1).code(), 5);
        assert_eq!(
            BackendError::FileOpen {
                path: PathBuf::from("x.ogg"),
                reason: "missing".into()
            }
            .code(),
            2
        );
        assert_eq!(BackendError::Unknown("?".into()).code(), -1);
    }

    #[test]
    fn test_params_kind() {
        let params = EffectParams::PeakEq(PeakEqParams {
            center_hz: 1000.0,
            bandwidth_octaves: 1.0,
            gain_db: -3.0,
        });
        assert_eq!(params.kind(), EffectKind::PeakEq);
    }
}
