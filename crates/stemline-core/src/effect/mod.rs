//! Stream effects run by the software backend
//!
//! Every effect processes a stereo buffer in place and is configured through
//! the typed [`EffectParams`] block the channel hands to the backend:
//! - [`CompressorEffect`] - loudness normalization on both stem paths
//! - [`PeakEqEffect`] - one band of the reverb-send EQ
//! - [`ReverbEffect`] - Freeverb on the reverb send
//! - [`PitchShiftEffect`] - whammy pitch bend

mod compressor;
mod eq;
mod pitch_shift;
mod reverb;

pub use compressor::CompressorEffect;
pub use eq::PeakEqEffect;
pub use pitch_shift::{PitchShiftEffect, MAX_PITCH_RATIO, MIN_PITCH_RATIO};
pub use reverb::ReverbEffect;

use thiserror::Error;

use crate::backend::{EffectKind, EffectParams};
use crate::types::StereoBuffer;

/// Parameter rejection reasons
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    /// Parameter block belongs to another effect kind
    #[error("Expected {expected:?} parameters, got {got:?}")]
    WrongKind { expected: EffectKind, got: EffectKind },

    /// A value is outside the accepted range
    #[error("{name} = {value} is out of range")]
    OutOfRange { name: &'static str, value: f32 },
}

/// An effect attached to a backend stream
pub trait StreamEffect: Send {
    /// Effect kind
    fn kind(&self) -> EffectKind;

    /// Apply a parameter block
    fn set_params(&mut self, params: &EffectParams) -> Result<(), ParamError>;

    /// Process a stereo buffer in place
    fn process(&mut self, buffer: &mut StereoBuffer);

    /// Clear internal state (called after seeks)
    fn reset(&mut self);
}

/// Create an effect of the given kind with its default parameters
pub fn create_effect(kind: EffectKind, sample_rate: u32) -> Box<dyn StreamEffect> {
    match kind {
        EffectKind::Compressor => Box::new(CompressorEffect::new(sample_rate)),
        EffectKind::PeakEq => Box::new(PeakEqEffect::new(sample_rate)),
        EffectKind::Reverb => Box::new(ReverbEffect::new(sample_rate)),
        EffectKind::PitchShift => Box::new(PitchShiftEffect::new(sample_rate)),
    }
}

/// Check a parameter block against an effect kind without an instance
///
/// Applies the same rules as [`StreamEffect::set_params`], so a block that
/// passes here is accepted by the effect.
pub fn validate_params(kind: EffectKind, params: &EffectParams, sample_rate: u32) -> Result<(), ParamError> {
    match (kind, params) {
        (EffectKind::Compressor, EffectParams::Compressor(p)) => compressor::check_params(p),
        (EffectKind::PeakEq, EffectParams::PeakEq(p)) => eq::check_params(p, sample_rate),
        (EffectKind::Reverb, EffectParams::Reverb(p)) => reverb::check_params(p),
        (EffectKind::PitchShift, EffectParams::PitchShift(p)) => pitch_shift::check_params(p),
        (expected, params) => Err(ParamError::WrongKind {
            expected,
            got: params.kind(),
        }),
    }
}

/// Reject a value outside `[min, max]`
fn check_range(name: &'static str, value: f32, min: f32, max: f32) -> Result<(), ParamError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ParamError::OutOfRange { name, value })
    }
}
